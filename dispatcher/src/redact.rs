//! Secret redaction for sensitive data in logs and serialized output.
//!
//! Mirrors `chain_client::redact::Redacted` (the Handler crate's same
//! utility) so a struct holding a secret can derive `Debug` without ever
//! printing the value.

use std::fmt::{self, Debug, Display};

#[derive(Clone, Copy)]
pub struct Redacted<T>(pub T);

impl<T> Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl<T> Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}
