//! # Architecture Support
//!
//! Only x86_64 is implemented. The encodings are plain data and compile on
//! every target; instruction-level code is confined to `x86_64::native`.

pub mod x86_64;
