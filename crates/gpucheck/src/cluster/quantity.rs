//! Parsing of Kubernetes resource quantities (`"2"`, `"500m"`, `"16Gi"`, `"1e3"`).

use crate::cluster::{ClusterError, ClusterResult, Quantity};

enum Scale {
    Multiply(f64),
    Divide(f64),
}

fn suffix_scale(suffix: &str) -> Option<Scale> {
    let scale = match suffix {
        "" => Scale::Multiply(1.0),
        "n" => Scale::Divide(1e9),
        "u" => Scale::Divide(1e6),
        "m" => Scale::Divide(1e3),
        "k" => Scale::Multiply(1e3),
        "M" => Scale::Multiply(1e6),
        "G" => Scale::Multiply(1e9),
        "T" => Scale::Multiply(1e12),
        "P" => Scale::Multiply(1e15),
        "E" => Scale::Multiply(1e18),
        "Ki" => Scale::Multiply(1024.0),
        "Mi" => Scale::Multiply(1024.0_f64.powi(2)),
        "Gi" => Scale::Multiply(1024.0_f64.powi(3)),
        "Ti" => Scale::Multiply(1024.0_f64.powi(4)),
        "Pi" => Scale::Multiply(1024.0_f64.powi(5)),
        "Ei" => Scale::Multiply(1024.0_f64.powi(6)),
        _ => {
            // Decimal exponent form, e.g. `1e3` or `5E-2`
            let exponent = suffix.strip_prefix(['e', 'E'])?.parse::<i32>().ok()?;
            if exponent >= 0 {
                Scale::Multiply(10.0_f64.powi(exponent))
            } else {
                Scale::Divide(10.0_f64.powi(-exponent))
            }
        }
    };
    Some(scale)
}

/// Parses a quantity and rounds it up to the nearest integer, the same way the Kubernetes API
/// reports integral values of fractional quantities.
pub fn parse_quantity(text: &str) -> ClusterResult<Quantity> {
    let invalid = || ClusterError::InvalidQuantity(text.to_string());

    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(text.len());
    let (number, suffix) = text.split_at(split);
    if number.is_empty() {
        return Err(invalid());
    }

    let number: f64 = number.parse().map_err(|_| invalid())?;
    let value = match suffix_scale(suffix).ok_or_else(invalid)? {
        Scale::Multiply(factor) => number * factor,
        Scale::Divide(divisor) => number / divisor,
    };
    let value = value.ceil();
    if !value.is_finite() || value > Quantity::MAX as f64 || value < Quantity::MIN as f64 {
        return Err(invalid());
    }
    Ok(value as Quantity)
}
