//! The filter registry and the filter-flags codec.
//!
//! Every filter is identified on the wire by a VLI filter ID followed by a
//! length-prefixed properties string. A block's filter chain lists one to
//! four filters; only the last one may (and must) be the end-capable
//! compressor, the others are size-preserving transforms.

use oxz_core::error::{Result, XzError};
use oxz_core::vli::{vli_decode, vli_encode, vli_size};
use oxz_filters::bcj::BcjArch;
use oxz_filters::delta::DeltaFilter;
use oxz_lzma::{LzmaOptions, dict_size_from_props, props_from_dict_size};

/// Filter IDs at or above this value are invalid in the container.
pub const FILTER_RESERVED_START: u64 = 1 << 62;

/// Most filters a single chain may hold.
pub const FILTERS_MAX: usize = 4;

/// Wire IDs of the registered filters.
pub mod id {
    /// Pass-through.
    pub const COPY: u64 = 0x00;
    /// Legacy subblock filter; recognised but not supported.
    pub const SUBBLOCK: u64 = 0x01;
    /// Byte-wise delta.
    pub const DELTA: u64 = 0x03;
    /// BCJ x86.
    pub const X86: u64 = 0x04;
    /// BCJ PowerPC.
    pub const POWERPC: u64 = 0x05;
    /// BCJ IA-64.
    pub const IA64: u64 = 0x06;
    /// BCJ ARM.
    pub const ARM: u64 = 0x07;
    /// BCJ ARM-Thumb.
    pub const ARMTHUMB: u64 = 0x08;
    /// BCJ SPARC.
    pub const SPARC: u64 = 0x09;
    /// BCJ ARM64.
    pub const ARM64: u64 = 0x0A;
    /// BCJ RISC-V.
    pub const RISCV: u64 = 0x0B;
    /// BCJ LoongArch.
    pub const LOONGARCH: u64 = 0x0C;
    /// LZMA2, the terminal compressor.
    pub const LZMA2: u64 = 0x21;
}

/// One configured filter of a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Pass-through filter.
    Copy,
    /// Delta filter with a distance of 1..=256.
    Delta {
        /// Distance between subtracted bytes.
        distance: usize,
    },
    /// A branch-address filter with an optional non-zero start offset.
    Bcj {
        /// Target architecture.
        arch: BcjArch,
        /// Absolute address of the first filtered byte.
        start_offset: u32,
    },
    /// The LZMA2 compressor. Only the dictionary size is carried on the
    /// wire; the remaining options steer the encoder.
    Lzma2 {
        /// Full encoder options; decoders use `options.dict_size`.
        options: LzmaOptions,
    },
}

fn bcj_id(arch: BcjArch) -> u64 {
    match arch {
        BcjArch::X86 => id::X86,
        BcjArch::PowerPc => id::POWERPC,
        BcjArch::Ia64 => id::IA64,
        BcjArch::Arm => id::ARM,
        BcjArch::ArmThumb => id::ARMTHUMB,
        BcjArch::Sparc => id::SPARC,
        BcjArch::Arm64 => id::ARM64,
        BcjArch::RiscV => id::RISCV,
        BcjArch::LoongArch => id::LOONGARCH,
    }
}

fn bcj_arch(filter_id: u64) -> Option<BcjArch> {
    Some(match filter_id {
        id::X86 => BcjArch::X86,
        id::POWERPC => BcjArch::PowerPc,
        id::IA64 => BcjArch::Ia64,
        id::ARM => BcjArch::Arm,
        id::ARMTHUMB => BcjArch::ArmThumb,
        id::SPARC => BcjArch::Sparc,
        id::ARM64 => BcjArch::Arm64,
        id::RISCV => BcjArch::RiscV,
        id::LOONGARCH => BcjArch::LoongArch,
        _ => return None,
    })
}

impl Filter {
    /// The wire identifier.
    pub fn id(&self) -> u64 {
        match self {
            Self::Copy => id::COPY,
            Self::Delta { .. } => id::DELTA,
            Self::Bcj { arch, .. } => bcj_id(*arch),
            Self::Lzma2 { .. } => id::LZMA2,
        }
    }

    /// Whether this filter may terminate a chain.
    pub fn is_end_capable(&self) -> bool {
        matches!(self, Self::Lzma2 { .. })
    }

    /// Serialize the filter-specific properties.
    pub fn props(&self) -> Vec<u8> {
        match self {
            Self::Copy => Vec::new(),
            Self::Delta { distance } => vec![(*distance - 1) as u8],
            Self::Bcj { start_offset, .. } => {
                if *start_offset == 0 {
                    Vec::new()
                } else {
                    start_offset.to_le_bytes().to_vec()
                }
            }
            Self::Lzma2 { options } => vec![props_from_dict_size(options.dict_size)],
        }
    }

    /// Reconstruct a filter from its wire identifier and properties.
    pub fn from_wire(filter_id: u64, props: &[u8]) -> Result<Self> {
        if filter_id >= FILTER_RESERVED_START {
            return Err(XzError::options("reserved filter ID"));
        }

        if let Some(arch) = bcj_arch(filter_id) {
            let start_offset = match props {
                [] => 0,
                [a, b, c, d] => u32::from_le_bytes([*a, *b, *c, *d]),
                _ => return Err(XzError::options("invalid BCJ filter properties")),
            };
            if start_offset % arch.alignment() != 0 {
                return Err(XzError::options("misaligned BCJ start offset"));
            }
            return Ok(Self::Bcj { arch, start_offset });
        }

        match filter_id {
            id::COPY => {
                if !props.is_empty() {
                    return Err(XzError::options("copy filter takes no properties"));
                }
                Ok(Self::Copy)
            }
            id::DELTA => {
                // Reuse the filter's own validation of the distance byte.
                let filter = DeltaFilter::from_props(props, false)?;
                Ok(Self::Delta {
                    distance: filter.distance(),
                })
            }
            id::LZMA2 => {
                let [byte] = props else {
                    return Err(XzError::options("LZMA2 properties must be one byte"));
                };
                let dict_size = dict_size_from_props(*byte)?;
                Ok(Self::Lzma2 {
                    options: LzmaOptions {
                        dict_size,
                        ..LzmaOptions::default()
                    },
                })
            }
            id::SUBBLOCK => Err(XzError::options("subblock filter is not supported")),
            _ => Err(XzError::options(format!(
                "unknown filter ID {filter_id:#x}"
            ))),
        }
    }

    /// Size of the serialized filter flags.
    pub fn flags_size(&self) -> usize {
        let props = self.props();
        vli_size(self.id()) + vli_size(props.len() as u64) + props.len()
    }

    /// Append the filter flags (ID, properties size, properties) to a
    /// buffer at `*pos`.
    pub fn encode_flags(&self, buf: &mut [u8], pos: &mut usize) -> Result<()> {
        let props = self.props();
        vli_encode(self.id(), buf, pos)?;
        vli_encode(props.len() as u64, buf, pos)?;
        if *pos + props.len() > buf.len() {
            return Err(XzError::program("filter flags do not fit"));
        }
        buf[*pos..*pos + props.len()].copy_from_slice(&props);
        *pos += props.len();
        Ok(())
    }

    /// Parse one filter's flags from a buffer at `*pos`.
    pub fn decode_flags(buf: &[u8], pos: &mut usize) -> Result<Self> {
        let filter_id = vli_decode(buf, pos)?;
        let props_size = vli_decode(buf, pos)?;
        if props_size > 255 {
            return Err(XzError::options("filter properties too long"));
        }
        let props_size = props_size as usize;
        if *pos + props_size > buf.len() {
            return Err(XzError::data("truncated filter properties"));
        }
        let props = &buf[*pos..*pos + props_size];
        *pos += props_size;
        Self::from_wire(filter_id, props)
    }
}

/// Check the chain rules: one to four filters, exactly the last one
/// end-capable, the rest size-preserving transforms.
pub fn validate_chain(filters: &[Filter]) -> Result<()> {
    if filters.is_empty() {
        return Err(XzError::options("empty filter chain"));
    }
    if filters.len() > FILTERS_MAX {
        return Err(XzError::options("more than four filters in a chain"));
    }

    let (last, rest) = filters.split_last().unwrap();
    if !last.is_end_capable() {
        return Err(XzError::options(
            "the last filter in a chain must be LZMA2",
        ));
    }
    for filter in rest {
        if filter.is_end_capable() {
            return Err(XzError::options(
                "only the last filter in a chain may be LZMA2",
            ));
        }
    }
    Ok(())
}
