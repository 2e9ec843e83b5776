pub mod decoder;
pub mod encoder;
pub mod modules;
pub mod skip;
pub mod vitunet;
