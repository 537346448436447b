//! Small shared runtime pieces used across the Roost crates: a token-bucket
//! rate limiter, a fixed-capacity ring buffer, and console helpers.

mod ansi;
mod rate;
mod ring;

pub use ansi::strip_ansi;
pub use rate::Rate;
pub use ring::Ring;
