//! Clock speed abstraction.
//!
//! `embedded-hal`/`embedded-hal-async` don't standardize changing an `SpiBus`'s frequency
//! at runtime, so the driver asks the platform to do it through this trait instead.

/// Init runs the card at this speed: comfortably inside the 100-400 kHz window every SD
/// card is guaranteed to tolerate before it has negotiated anything.
pub const SLOW_HZ: u32 = 200_000;
/// Steady-state speed once the card has been brought up.
pub const FAST_HZ: u32 = 2_000_000;

/// Lets the Initialization Controller step the bus from [`SLOW_HZ`] to [`FAST_HZ`] once the
/// card is ready, without the driver needing to know which peripheral it's talking to.
pub trait ClockControl {
    type Error: core::fmt::Debug;

    /// Configure the bus for card detection / the init handshake.
    async fn set_slow(&mut self) -> Result<(), Self::Error>;

    /// Configure the bus for steady-state transfers.
    async fn set_fast(&mut self) -> Result<(), Self::Error>;
}
