//! Cross-crate scenarios run against the in-process backend.

#[cfg(test)]
mod unit;
