//! Validation errors for order and instrument input.

/// Programmer-error inputs. These are returned synchronously and never retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ValidationError {
    #[error("quantity must be greater than zero")]
    NonPositiveQuantity,
    #[error("limit price must be greater than zero")]
    NonPositivePrice,
    #[error("strike must be greater than zero")]
    NonPositiveStrike,
    #[error("symbol must not be empty")]
    EmptySymbol,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(
            format!("{}", ValidationError::NonPositiveQuantity),
            "quantity must be greater than zero"
        );
        assert_eq!(
            format!("{}", ValidationError::NonPositivePrice),
            "limit price must be greater than zero"
        );
    }

    #[test]
    fn is_error() {
        let err: Box<dyn std::error::Error> = Box::new(ValidationError::EmptySymbol);
        assert!(err.to_string().contains("symbol"));
    }
}
