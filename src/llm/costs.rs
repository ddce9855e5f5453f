//! Per-token pricing for known chat models.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// (input, output) USD per token. Unknown models cost zero.
pub fn model_cost(model: &str) -> (Decimal, Decimal) {
    // Longest prefix first: "gpt-4o-mini" must not match "gpt-4o".
    match model {
        m if m.starts_with("gpt-4o-mini") => (dec!(0.00000015), dec!(0.0000006)),
        m if m.starts_with("gpt-4o") => (dec!(0.0000025), dec!(0.00001)),
        m if m.starts_with("gpt-4.1-mini") => (dec!(0.0000004), dec!(0.0000016)),
        m if m.starts_with("gpt-4.1") => (dec!(0.000002), dec!(0.000008)),
        m if m.starts_with("gpt-3.5-turbo") => (dec!(0.0000005), dec!(0.0000015)),
        _ => (Decimal::ZERO, Decimal::ZERO),
    }
}
