pub mod common;
pub mod run;
pub mod taskloop;
pub mod taskrun;

pub use common::*;
pub use run::*;
pub use taskloop::*;
pub use taskrun::*;
