//! Bit-level format of the 64-byte control header.
//!
//! The hardware generator emits field positions alongside the bitstream,
//! so nothing here is hard-coded into the codec: a [`ControlFormat`] is
//! handed in at construction and checked once.
//!
//! Bits are numbered little-endian across the header: bit `n` is bit
//! `n % 8` of byte `n / 8`. `valid` is always bit 0.

use std::fmt;

use crate::layout::CONTROL_HEADER_SIZE;

const HEADER_BITS: usize = CONTROL_HEADER_SIZE * 8;

/// A contiguous run of bits inside the control header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitField {
    pub offset: u16,
    pub width: u8,
}

impl BitField {
    pub const fn new(offset: u16, width: u8) -> Self {
        Self { offset, width }
    }

    #[inline]
    pub const fn start(&self) -> usize {
        self.offset as usize
    }

    #[inline]
    pub const fn end(&self) -> usize {
        self.offset as usize + self.width as usize
    }

    /// Largest value the field can hold.
    pub const fn max_value(&self) -> u64 {
        if self.width >= 64 {
            u64::MAX
        } else {
            (1u64 << self.width) - 1
        }
    }

    /// Read the field out of `bytes`.
    pub fn extract(&self, bytes: &[u8]) -> u64 {
        let mut value = 0u64;
        for i in 0..self.width as usize {
            let bit = self.start() + i;
            if (bytes[bit / 8] >> (bit % 8)) & 1 == 1 {
                value |= 1 << i;
            }
        }
        value
    }

    /// Write the low `width` bits of `value` into `bytes`.
    pub fn insert(&self, bytes: &mut [u8], value: u64) {
        for i in 0..self.width as usize {
            let bit = self.start() + i;
            let mask = 1u8 << (bit % 8);
            if (value >> i) & 1 == 1 {
                bytes[bit / 8] |= mask;
            } else {
                bytes[bit / 8] &= !mask;
            }
        }
    }

    const fn overlaps(&self, other: &BitField) -> bool {
        ranges_overlap(self.start(), self.end(), other.start(), other.end())
    }
}

const fn ranges_overlap(a_start: usize, a_end: usize, b_start: usize, b_end: usize) -> bool {
    a_start < b_end && b_start < a_end
}

/// Numeric codes the hardware uses in the `ty` and `hdr_ty` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagCodes {
    pub bypass: u64,
    pub onc_rpc_call: u64,
    pub onc_rpc_reply: u64,
    pub hdr_ethernet: u64,
    pub hdr_ip: u64,
    pub hdr_udp: u64,
}

/// Positions of every control-header field.
///
/// `valid`, `len` and `ty` are common to every transaction type. `hdr_ty`
/// and the bypass header bytes only apply to bypass transactions;
/// `func_ptr`, `xid` and the argument words only to ONC-RPC ones. The two
/// groups may share bits with each other but not with the common fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlFormat {
    pub valid: BitField,
    pub len: BitField,
    pub ty: BitField,
    pub hdr_ty: BitField,
    /// Byte offset of the raw bypass header.
    pub bypass_header_offset: usize,
    /// Bytes reserved for the raw bypass header.
    pub bypass_header_size: usize,
    pub func_ptr: BitField,
    pub xid: BitField,
    /// Byte offset of the first inline ONC-RPC argument word.
    pub rpc_args_offset: usize,
    /// Number of 32-bit argument words carried in the header.
    pub rpc_inline_words: usize,
    pub tags: TagCodes,
}

/// Format emitted by the current Lauberhorn bitstream.
pub const DEFAULT_FORMAT: ControlFormat = ControlFormat {
    valid: BitField::new(0, 1),
    len: BitField::new(1, 14),
    ty: BitField::new(15, 4),
    hdr_ty: BitField::new(19, 3),
    bypass_header_offset: 4,
    bypass_header_size: 42,
    func_ptr: BitField::new(64, 64),
    xid: BitField::new(128, 32),
    rpc_args_offset: 20,
    rpc_inline_words: 11,
    tags: TagCodes {
        bypass: 1,
        onc_rpc_call: 2,
        onc_rpc_reply: 3,
        hdr_ethernet: 1,
        hdr_ip: 2,
        hdr_udp: 3,
    },
};

const _: () = assert!(DEFAULT_FORMAT.check().is_ok());

/// Errors from validating a [`ControlFormat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatError {
    /// `valid` must be the single bit 0.
    ValidNotBitZero(BitField),
    /// Width is zero or wider than 64 bits.
    BadWidth(&'static str),
    /// Field extends past the 64-byte header.
    OutOfHeader(&'static str),
    Overlap(&'static str, &'static str),
    /// A tag does not fit in its field or is zero (zero means error).
    TagOutOfRange { tag: &'static str, value: u64 },
    DuplicateTag(&'static str, &'static str),
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatError::ValidNotBitZero(field) => write!(
                f,
                "valid flag must be bit 0 with width 1, found offset {} width {}",
                field.offset, field.width
            ),
            FormatError::BadWidth(name) => write!(f, "field {name} must be 1 to 64 bits wide"),
            FormatError::OutOfHeader(name) => {
                write!(f, "field {name} extends past the {CONTROL_HEADER_SIZE}-byte header")
            }
            FormatError::Overlap(a, b) => write!(f, "fields {a} and {b} overlap"),
            FormatError::TagOutOfRange { tag, value } => {
                write!(f, "tag {tag} = {value} does not fit its field")
            }
            FormatError::DuplicateTag(a, b) => write!(f, "tags {a} and {b} share a code"),
        }
    }
}

impl std::error::Error for FormatError {}

impl ControlFormat {
    pub const fn check(&self) -> Result<(), FormatError> {
        if self.valid.offset != 0 || self.valid.width != 1 {
            return Err(FormatError::ValidNotBitZero(self.valid));
        }

        let fields = [
            ("len", self.len),
            ("ty", self.ty),
            ("hdr_ty", self.hdr_ty),
            ("func_ptr", self.func_ptr),
            ("xid", self.xid),
        ];
        let mut i = 0;
        while i < fields.len() {
            let (name, field) = fields[i];
            if field.width == 0 || field.width > 64 {
                return Err(FormatError::BadWidth(name));
            }
            if field.end() > HEADER_BITS {
                return Err(FormatError::OutOfHeader(name));
            }
            i += 1;
        }
        if self.bypass_header_offset.saturating_add(self.bypass_header_size) > CONTROL_HEADER_SIZE {
            return Err(FormatError::OutOfHeader("bypass_header"));
        }
        if self
            .rpc_args_offset
            .saturating_add(self.rpc_inline_words.saturating_mul(4))
            > CONTROL_HEADER_SIZE
        {
            return Err(FormatError::OutOfHeader("rpc_args"));
        }

        let common = [("valid", self.valid), ("len", self.len), ("ty", self.ty)];
        let header_start = self.bypass_header_offset * 8;
        let header_end = (self.bypass_header_offset + self.bypass_header_size) * 8;
        let args_start = self.rpc_args_offset * 8;
        let args_end = (self.rpc_args_offset + self.rpc_inline_words * 4) * 8;

        let mut i = 0;
        while i < common.len() {
            let (name, field) = common[i];
            let mut j = i + 1;
            while j < common.len() {
                if field.overlaps(&common[j].1) {
                    return Err(FormatError::Overlap(name, common[j].0));
                }
                j += 1;
            }
            let private = [
                ("hdr_ty", self.hdr_ty),
                ("func_ptr", self.func_ptr),
                ("xid", self.xid),
            ];
            let mut k = 0;
            while k < private.len() {
                if field.overlaps(&private[k].1) {
                    return Err(FormatError::Overlap(name, private[k].0));
                }
                k += 1;
            }
            if ranges_overlap(field.start(), field.end(), header_start, header_end) {
                return Err(FormatError::Overlap(name, "bypass_header"));
            }
            if ranges_overlap(field.start(), field.end(), args_start, args_end) {
                return Err(FormatError::Overlap(name, "rpc_args"));
            }
            i += 1;
        }

        if ranges_overlap(
            self.hdr_ty.start(),
            self.hdr_ty.end(),
            header_start,
            header_end,
        ) {
            return Err(FormatError::Overlap("hdr_ty", "bypass_header"));
        }
        if self.func_ptr.overlaps(&self.xid) {
            return Err(FormatError::Overlap("func_ptr", "xid"));
        }
        if ranges_overlap(self.func_ptr.start(), self.func_ptr.end(), args_start, args_end) {
            return Err(FormatError::Overlap("func_ptr", "rpc_args"));
        }
        if ranges_overlap(self.xid.start(), self.xid.end(), args_start, args_end) {
            return Err(FormatError::Overlap("xid", "rpc_args"));
        }

        let ty_tags = [
            ("bypass", self.tags.bypass),
            ("onc_rpc_call", self.tags.onc_rpc_call),
            ("onc_rpc_reply", self.tags.onc_rpc_reply),
        ];
        if let Err(e) = check_tags(&ty_tags, self.ty) {
            return Err(e);
        }
        let hdr_tags = [
            ("hdr_ethernet", self.tags.hdr_ethernet),
            ("hdr_ip", self.tags.hdr_ip),
            ("hdr_udp", self.tags.hdr_udp),
        ];
        check_tags(&hdr_tags, self.hdr_ty)
    }

    pub fn validate(&self) -> Result<(), FormatError> {
        self.check()
    }

    /// Largest length the `len` field can describe.
    #[inline]
    pub const fn max_length(&self) -> usize {
        let max = self.len.max_value();
        if max > usize::MAX as u64 {
            usize::MAX
        } else {
            max as usize
        }
    }

    /// Bytes available for inline ONC-RPC arguments.
    #[inline]
    pub const fn rpc_args_size(&self) -> usize {
        self.rpc_inline_words * 4
    }
}

const fn check_tags(tags: &[(&'static str, u64); 3], field: BitField) -> Result<(), FormatError> {
    let mut i = 0;
    while i < tags.len() {
        let (name, value) = tags[i];
        if value == 0 || value > field.max_value() {
            return Err(FormatError::TagOutOfRange { tag: name, value });
        }
        let mut j = i + 1;
        while j < tags.len() {
            if tags[j].1 == value {
                return Err(FormatError::DuplicateTag(name, tags[j].0));
            }
            j += 1;
        }
        i += 1;
    }
    Ok(())
}

impl Default for ControlFormat {
    fn default() -> Self {
        DEFAULT_FORMAT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitfield_straddles_bytes() {
        let field = BitField::new(5, 10);
        let mut bytes = [0u8; 4];
        field.insert(&mut bytes, 0x3ff);
        assert_eq!(bytes, [0xe0, 0x7f, 0, 0]);
        assert_eq!(field.extract(&bytes), 0x3ff);

        field.insert(&mut bytes, 0x155);
        assert_eq!(field.extract(&bytes), 0x155);
        // Neighbouring bits untouched.
        assert_eq!(bytes[0] & 0x1f, 0);
        assert_eq!(bytes[1] & 0x80, 0);
    }

    #[test]
    fn insert_truncates_to_width() {
        let field = BitField::new(0, 3);
        let mut bytes = [0u8; 1];
        field.insert(&mut bytes, 0xff);
        assert_eq!(bytes[0], 0b111);
        assert_eq!(field.max_value(), 7);
    }

    #[test]
    fn full_width_field() {
        let field = BitField::new(64, 64);
        let mut bytes = [0u8; 16];
        field.insert(&mut bytes, 0xdead_beef_cafe_f00d);
        assert_eq!(field.extract(&bytes), 0xdead_beef_cafe_f00d);
        assert_eq!(&bytes[8..], &0xdead_beef_cafe_f00du64.to_le_bytes());
        assert_eq!(field.max_value(), u64::MAX);
    }

    #[test]
    fn default_format_is_valid() {
        assert_eq!(DEFAULT_FORMAT.validate(), Ok(()));
        assert!(DEFAULT_FORMAT.max_length() >= 64 + 16 * 128);
    }

    #[test]
    fn valid_must_be_bit_zero() {
        let format = ControlFormat {
            valid: BitField::new(1, 1),
            ..DEFAULT_FORMAT
        };
        assert!(matches!(format.validate(), Err(FormatError::ValidNotBitZero(_))));
    }

    #[test]
    fn common_fields_must_not_overlap() {
        let format = ControlFormat {
            ty: BitField::new(10, 4),
            ..DEFAULT_FORMAT
        };
        assert_eq!(format.validate(), Err(FormatError::Overlap("len", "ty")));
    }

    #[test]
    fn bypass_header_must_fit() {
        let format = ControlFormat {
            bypass_header_size: 61,
            ..DEFAULT_FORMAT
        };
        assert_eq!(format.validate(), Err(FormatError::OutOfHeader("bypass_header")));
    }

    #[test]
    fn rpc_args_may_not_cover_xid() {
        let format = ControlFormat {
            rpc_args_offset: 16,
            rpc_inline_words: 4,
            ..DEFAULT_FORMAT
        };
        assert_eq!(format.validate(), Err(FormatError::Overlap("xid", "rpc_args")));
    }

    #[test]
    fn tags_must_be_distinct_and_nonzero() {
        let mut format = DEFAULT_FORMAT;
        format.tags.onc_rpc_reply = format.tags.onc_rpc_call;
        assert_eq!(
            format.validate(),
            Err(FormatError::DuplicateTag("onc_rpc_call", "onc_rpc_reply"))
        );

        let mut format = DEFAULT_FORMAT;
        format.tags.bypass = 0;
        assert!(matches!(
            format.validate(),
            Err(FormatError::TagOutOfRange { tag: "bypass", .. })
        ));

        let mut format = DEFAULT_FORMAT;
        format.tags.hdr_udp = 8;
        assert!(matches!(
            format.validate(),
            Err(FormatError::TagOutOfRange { tag: "hdr_udp", .. })
        ));
    }
}
