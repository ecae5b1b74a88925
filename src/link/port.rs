//! Hardware collaborators of the link
//!
//! The session only needs two things from the platform: a transfer call on the
//! serial bus and a readable input line. Real backends (spidev, GPIO character
//! devices) implement these outside this crate.

use std::io;

/// Full-duplex byte transfer
///
/// Every byte written shifts one byte in, so the returned buffer has the same
/// length as `tx`.
pub trait LinkPort: Send {
    fn transfer(&mut self, tx: &[u8]) -> io::Result<Vec<u8>>;
}

/// Digital input line driven by the remote device
pub trait SignalLine: Send {
    fn is_high(&mut self) -> io::Result<bool>;
}

impl<P: LinkPort + ?Sized> LinkPort for Box<P> {
    fn transfer(&mut self, tx: &[u8]) -> io::Result<Vec<u8>> {
        (**self).transfer(tx)
    }
}

impl<S: SignalLine + ?Sized> SignalLine for Box<S> {
    fn is_high(&mut self) -> io::Result<bool> {
        (**self).is_high()
    }
}
