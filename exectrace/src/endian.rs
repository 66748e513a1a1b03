use std::fmt;
use std::sync::LazyLock;

/// Byte order of the records written by the kernel program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endianness {
    Little,
    Big,
}

/// Byte order of the running processor, resolved once at first use. Probed at
/// runtime since some architectures can be booted into either mode.
pub static NATIVE_ENDIAN: LazyLock<Endianness> = LazyLock::new(Endianness::detect);

impl Endianness {
    pub fn native() -> Self {
        *NATIVE_ENDIAN
    }

    fn detect() -> Self {
        match 0xABCDu16.to_ne_bytes() {
            [0xCD, 0xAB] => Endianness::Little,
            _ => Endianness::Big,
        }
    }

    /// Reinterprets a field that was read in native memory order as a value
    /// encoded in `self` order.
    pub fn u32(self, raw: u32) -> u32 {
        let bytes = raw.to_ne_bytes();
        match self {
            Endianness::Little => u32::from_le_bytes(bytes),
            Endianness::Big => u32::from_be_bytes(bytes),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Endianness::Little => "little-endian",
            Endianness::Big => "big-endian",
        }
    }
}

impl fmt::Display for Endianness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
