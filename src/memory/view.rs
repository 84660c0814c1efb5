use std::ops::Neg;

use super::{AddressSpace, Result};
use crate::profile::TargetProfile;

/// Signed distance between where an image's tables were built to live and
/// where they actually are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RelocationDelta(i64);

impl RelocationDelta {
    pub const fn new(delta: i64) -> Self {
        Self(delta)
    }

    /// Delta that moves RVAs relative to `actual` onto RVAs relative to `expected`.
    pub const fn between(expected: u64, actual: u64) -> Self {
        Self(expected.wrapping_sub(actual) as i64)
    }

    pub const fn value(self) -> i64 {
        self.0
    }

    pub const fn apply_u32(self, rva: u32) -> u32 {
        (rva as i64).wrapping_add(self.0) as u32
    }

    pub const fn apply_u64(self, value: u64) -> u64 {
        value.wrapping_add(self.0 as u64)
    }
}

impl Neg for RelocationDelta {
    type Output = RelocationDelta;

    fn neg(self) -> Self::Output {
        RelocationDelta(self.0.wrapping_neg())
    }
}

/// RVA-addressed window onto an image in an [`AddressSpace`].
#[derive(Clone, Copy)]
pub struct ImageView<'a> {
    space: &'a AddressSpace,
    base: u64,
    profile: TargetProfile,
}

impl<'a> ImageView<'a> {
    pub fn new(space: &'a AddressSpace, base: u64, profile: TargetProfile) -> Self {
        Self { space, base, profile }
    }

    pub fn space(&self) -> &'a AddressSpace {
        self.space
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn profile(&self) -> TargetProfile {
        self.profile
    }

    pub fn pointer_width(&self) -> usize {
        self.profile.pointer_width()
    }

    pub fn addr(&self, rva: u64) -> u64 {
        self.base.wrapping_add(rva)
    }

    pub fn read_u16(&self, rva: u64) -> Result<u16> {
        self.space.read_u16(self.addr(rva))
    }

    pub fn read_u32(&self, rva: u64) -> Result<u32> {
        self.space.read_u32(self.addr(rva))
    }

    pub fn write_u16(&self, rva: u64, value: u16) -> Result<()> {
        self.space.write_u16(self.addr(rva), value)
    }

    pub fn write_u32(&self, rva: u64, value: u32) -> Result<()> {
        self.space.write_u32(self.addr(rva), value)
    }

    /// Read a pointer-sized value, zero-extended.
    pub fn read_ptr(&self, rva: u64) -> Result<u64> {
        match self.pointer_width() {
            8 => self.space.read_u64(self.addr(rva)),
            _ => self.space.read_u32(self.addr(rva)).map(u64::from),
        }
    }

    /// Write a pointer-sized value, truncating on 32-bit profiles.
    pub fn write_ptr(&self, rva: u64, value: u64) -> Result<()> {
        match self.pointer_width() {
            8 => self.space.write_u64(self.addr(rva), value),
            _ => self.space.write_u32(self.addr(rva), value as u32),
        }
    }

    pub fn read_bytes(&self, rva: u64, buf: &mut [u8]) -> Result<()> {
        self.space.read(self.addr(rva), buf)
    }

    pub fn write_bytes(&self, rva: u64, buf: &[u8]) -> Result<()> {
        self.space.write(self.addr(rva), buf)
    }

    pub fn read_cstr(&self, rva: u64) -> Result<Vec<u8>> {
        self.space.read_cstr(self.addr(rva), MAX_NAME_LEN)
    }
}

/// Longest symbol or module name the loader will read out of an image.
pub const MAX_NAME_LEN: usize = 4096;
