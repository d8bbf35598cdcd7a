// src/drivers/mod.rs
pub mod error;
pub mod source;
pub mod virtual_scanner;

pub use error::{HardwareFault, ScanError};
#[cfg(test)]
pub use source::ManualScanner;
pub use source::{
    DarkSpectrum, RawSpectrum, ScannerHead, SpectrumSource, StepDirection,
    DEFAULT_SATURATION_LEVEL,
};
pub use virtual_scanner::{SimulationConfig, SyntheticPlume, VirtualScanner};
