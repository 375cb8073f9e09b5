#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod ars;
pub mod config;
pub mod distributions;
pub mod io;
pub mod kernel;
pub mod marker;
pub mod pipeline;
pub mod prepare;
pub mod quadrature;
pub mod sampler;
pub mod types;
pub mod writer;
