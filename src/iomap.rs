//! IO map: the contiguous byte region the application supplies (spec §3
//! "IO map"). Outputs occupy `[0, Obytes)`; inputs follow in non-overlap
//! mode or alias the same bytes in overlap mode.

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlapMode {
    /// Inputs occupy bytes after the output region.
    NonOverlap,
    /// Inputs and outputs alias the same bytes (spec §3 "overlaid").
    Overlap,
}

/// Tracks allocation of a caller-supplied IO map buffer (spec §3).
pub struct IoMap<'a> {
    buf: &'a mut [u8],
    mode: OverlapMode,
    output_bytes: u32,
    input_bytes: u32,
    mailbox_status_bytes: u32,
}

impl<'a> IoMap<'a> {
    pub fn new(buf: &'a mut [u8], mode: OverlapMode) -> Self {
        Self {
            buf,
            mode,
            output_bytes: 0,
            input_bytes: 0,
            mailbox_status_bytes: 0,
        }
    }

    pub fn mode(&self) -> OverlapMode {
        self.mode
    }

    /// Reserves `output_bytes` of output and `input_bytes` of input,
    /// returning the byte offsets each region starts at. In overlap mode
    /// both offsets are 0 (spec §3 "same bytes hold outputs outbound and
    /// inputs inbound").
    pub fn reserve(&mut self, output_bytes: u32, input_bytes: u32) -> Result<(u32, u32), Error> {
        let (out_off, in_off) = match self.mode {
            OverlapMode::NonOverlap => (self.output_bytes, self.output_bytes + self.input_bytes),
            OverlapMode::Overlap => (0, 0),
        };
        self.output_bytes += output_bytes;
        self.input_bytes = self.input_bytes.max(input_bytes);
        let required = match self.mode {
            OverlapMode::NonOverlap => self.output_bytes + self.input_bytes,
            OverlapMode::Overlap => self.output_bytes.max(self.input_bytes),
        } + self.mailbox_status_bytes;
        if required as usize > self.buf.len() {
            return Err(Error::Capacity);
        }
        Ok((out_off, in_off))
    }

    /// Reserves the trailing mailbox-status region (spec §3 "Mailbox-status
    /// bytes occupy the trailing region").
    pub fn reserve_mailbox_status(&mut self, bytes: u32) -> Result<u32, Error> {
        let data_region = match self.mode {
            OverlapMode::NonOverlap => self.output_bytes + self.input_bytes,
            OverlapMode::Overlap => self.output_bytes.max(self.input_bytes),
        };
        let offset = data_region + self.mailbox_status_bytes;
        self.mailbox_status_bytes += bytes;
        if (offset + bytes) as usize > self.buf.len() {
            return Err(Error::Capacity);
        }
        Ok(offset)
    }

    pub fn outputs(&self) -> &[u8] {
        &self.buf[0..self.output_bytes as usize]
    }

    pub fn outputs_mut(&mut self) -> &mut [u8] {
        &mut self.buf[0..self.output_bytes as usize]
    }

    pub fn inputs(&self, input_offset: u32) -> &[u8] {
        let start = input_offset as usize;
        &self.buf[start..start + self.input_bytes as usize]
    }

    pub fn inputs_mut(&mut self, input_offset: u32) -> &mut [u8] {
        let start = input_offset as usize;
        &mut self.buf[start..start + self.input_bytes as usize]
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_overlap_mode_places_inputs_after_outputs() {
        let mut backing = [0u8; 64];
        let mut map = IoMap::new(&mut backing, OverlapMode::NonOverlap);
        let (out_off, in_off) = map.reserve(10, 6).unwrap();
        assert_eq!(out_off, 0);
        assert_eq!(in_off, 10);
    }

    #[test]
    fn overlap_mode_aliases_same_bytes() {
        let mut backing = [0u8; 64];
        let mut map = IoMap::new(&mut backing, OverlapMode::Overlap);
        let (out_off, in_off) = map.reserve(10, 10).unwrap();
        assert_eq!(out_off, 0);
        assert_eq!(in_off, 0);
    }

    #[test]
    fn reserve_beyond_capacity_fails() {
        let mut backing = [0u8; 4];
        let mut map = IoMap::new(&mut backing, OverlapMode::NonOverlap);
        assert_eq!(map.reserve(10, 10), Err(Error::Capacity));
    }
}
