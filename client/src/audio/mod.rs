pub mod synthetic;

#[cfg(feature = "device")]
pub mod capture;
#[cfg(feature = "device")]
pub mod playout;
