//! The parse context threaded through every read: whether the container is
//! 32 or 64 bit, and which endianness its fields are stored in.

use scroll::Endian;

/// The width of a Mach-O container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Container {
    Bits32,
    #[default]
    Bits64,
}

impl Container {
    pub fn is_64(self) -> bool {
        self == Container::Bits64
    }
}

/// A parse context: container width plus data endianness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ctx {
    pub container: Container,
    pub le: Endian,
}

impl Ctx {
    pub fn new(container: Container, le: Endian) -> Self {
        Ctx { container, le }
    }

    pub fn is_64(&self) -> bool {
        self.container.is_64()
    }

    pub fn is_big_endian(&self) -> bool {
        !self.le.is_little()
    }
}
