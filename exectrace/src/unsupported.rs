//! Stand-ins for platforms without BPF. Construction always fails, so the
//! remaining methods can never be reached.

use std::convert::Infallible;

use crate::config::TracerConfig;
use crate::endian::Endianness;
use crate::error::{Error, Result};
use crate::event::Event;

fn unsupported() -> Error {
    Error::UnsupportedPlatform(std::env::consts::OS)
}

pub struct KernelObjects {
    never: Infallible,
}

impl KernelObjects {
    pub fn load(_image: &[u8]) -> Result<Self> {
        Err(unsupported())
    }

    pub fn set_pid_ns_filter(&self, _pid_ns: u32) -> Result<()> {
        match self.never {}
    }

    pub fn close(&self) -> Result<()> {
        match self.never {}
    }
}

pub struct Tracer {
    never: Infallible,
}

impl Tracer {
    pub fn new(_image: &[u8], _config: TracerConfig) -> Result<Self> {
        Err(unsupported())
    }

    pub async fn read(&self) -> Result<Event> {
        match self.never {}
    }

    pub fn close(&self) -> Result<()> {
        match self.never {}
    }

    pub fn is_closed(&self) -> bool {
        match self.never {}
    }

    pub fn pid_ns(&self) -> u32 {
        match self.never {}
    }

    pub fn endianness(&self) -> Endianness {
        match self.never {}
    }
}
