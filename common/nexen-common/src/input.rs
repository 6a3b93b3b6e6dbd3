use bincode::{Decode, Encode};
use nexen_proc_macros::{EnumAll, EnumDisplay};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Encode, Decode, EnumDisplay, EnumAll,
)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Player {
    #[default]
    One,
    Two,
}

impl Player {
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::One => 0,
            Self::Two => 1,
        }
    }
}

/// Access to a console's controller ports as raw button bitfields.
///
/// The bit layout is console-specific but stable for a given console, which is what movie
/// recording, rewind input logs, and the host input path rely on.
pub trait PortInputs {
    /// Number of controller ports exposed by the console.
    const PORTS: usize;

    /// Replace the state of the given port with the given button bits. Out-of-range ports are
    /// ignored.
    fn set_port_bits(&mut self, port: usize, bits: u16);

    /// Snapshot the state of the given port as button bits. Out-of-range ports return 0.
    fn port_bits(&self, port: usize) -> u16;
}
