use memchr::memmem;

/// The first byte of each NALU contains its type. If you just need the type without decoding the
/// NALU, mask the first byte with this.
pub const NAL_UNIT_TYPE_MASK: u8 = 0x1f;

const START_CODE: &[u8] = &[0, 0, 1];

// ITU-T H.264, 04/2017, Table 7-1
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NalUnitType {
    NonIdrSlice,
    IdrSlice,
    Sei,
    SequenceParameterSet,
    PictureParameterSet,
    AccessUnitDelimiter,
    Other(u8),
}

impl NalUnitType {
    pub fn from_header(header: u8) -> Self {
        match header & NAL_UNIT_TYPE_MASK {
            1 => Self::NonIdrSlice,
            5 => Self::IdrSlice,
            6 => Self::Sei,
            7 => Self::SequenceParameterSet,
            8 => Self::PictureParameterSet,
            9 => Self::AccessUnitDelimiter,
            t => Self::Other(t),
        }
    }

    /// Returns the type of a NALU without its start code, or `None` if it's empty.
    pub fn of(nalu: &[u8]) -> Option<Self> {
        nalu.first().map(|&b| Self::from_header(b))
    }
}

/// Iterates over the NAL units of an Annex B byte stream. Start codes are stripped, and anything
/// before the first start code is ignored.
pub struct AnnexBIter<'a> {
    buf: &'a [u8],
}

pub fn iterate_annex_b(buf: &[u8]) -> AnnexBIter<'_> {
    AnnexBIter { buf }
}

impl<'a> Iterator for AnnexBIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let start = memmem::find(self.buf, START_CODE)? + START_CODE.len();
            let rest = &self.buf[start..];
            let (nalu, remaining) = match memmem::find(rest, START_CODE) {
                Some(end) => rest.split_at(end),
                None => (rest, &rest[rest.len()..]),
            };
            self.buf = remaining;

            // the zero byte of a 4-byte start code (and any trailing_zero_8bits) belongs to the
            // stream, not the NALU
            let len = nalu.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
            if len > 0 {
                return Some(&nalu[..len]);
            }
        }
    }
}
