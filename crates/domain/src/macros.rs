//! Wire-name conversions for small domain enums
//!
//! Persisted records and configuration files spell enum values in a fixed
//! textual form (`"stale-while-revalidate"`, `"retrying"`). This macro keeps
//! `Display` and `FromStr` in lockstep with that form.
//!
//! ```rust
//! use tidemark_domain::impl_domain_status_conversions;
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq)]
//! pub enum Tide {
//!     Rising,
//!     Falling,
//! }
//!
//! impl_domain_status_conversions!(Tide {
//!     Rising => "rising",
//!     Falling => "falling",
//! });
//!
//! assert_eq!(Tide::Rising.to_string(), "rising");
//! assert_eq!("FALLING".parse::<Tide>(), Ok(Tide::Falling));
//! ```

/// Implements `Display` and case-insensitive `FromStr` for a fieldless enum
#[macro_export]
macro_rules! impl_domain_status_conversions {
    ($enum_name:ident { $($variant:ident => $str:expr),+ $(,)? }) => {
        impl std::fmt::Display for $enum_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $(Self::$variant => f.write_str($str),)+
                }
            }
        }

        impl std::str::FromStr for $enum_name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_lowercase().as_str() {
                    $($str => Ok(Self::$variant),)+
                    _ => Err(format!("Invalid {}: {}", stringify!($enum_name), s)),
                }
            }
        }
    };
}
