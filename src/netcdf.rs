//! NetCDF classic header decoder.
//!
//! Decodes the header of CDF-1 (classic), CDF-2 (64-bit offset) and CDF-5
//! (64-bit data) files: dimensions, variables with their declared types,
//! and global text attributes. Variable data is never read, so a byte range
//! covering the header is enough.
//!
//! ```text
//! header   = magic numrecs dim_list gatt_list var_list
//! magic    = 'C' 'D' 'F' version          version ∈ {1, 2, 5}
//! dim_list = ABSENT | NC_DIMENSION nelems [name length ...]
//! att_list = ABSENT | NC_ATTRIBUTE nelems [name nc_type nelems values ...]
//! var_list = ABSENT | NC_VARIABLE  nelems [name nelems [dimid ...] att_list nc_type vsize begin ...]
//! ```
//!
//! All integers are big-endian. Counts and lengths are 32-bit except in
//! CDF-5, where they are 64-bit; `begin` offsets are 64-bit in CDF-2 and
//! CDF-5. Names and attribute values are padded to a 4-byte boundary.

use std::collections::BTreeMap;

use thiserror::Error;

const NC_DIMENSION: u32 = 0x0A;
const NC_VARIABLE: u32 = 0x0B;
const NC_ATTRIBUTE: u32 = 0x0C;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum NetcdfError {
    #[error("not a NetCDF classic file")]
    BadMagic,
    #[error("unsupported NetCDF version byte {0}")]
    UnsupportedVersion(u8),
    #[error("header truncated at byte {0}; increase header_bytes")]
    Truncated(usize),
    #[error("malformed header: {0}")]
    Malformed(String),
}

/// Declared external type of a variable or attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcType {
    Byte,
    Char,
    Short,
    Int,
    Float,
    Double,
    UByte,
    UShort,
    UInt,
    Int64,
    UInt64,
}

impl NcType {
    fn from_code(code: u32) -> Result<Self, NetcdfError> {
        Ok(match code {
            1 => NcType::Byte,
            2 => NcType::Char,
            3 => NcType::Short,
            4 => NcType::Int,
            5 => NcType::Float,
            6 => NcType::Double,
            7 => NcType::UByte,
            8 => NcType::UShort,
            9 => NcType::UInt,
            10 => NcType::Int64,
            11 => NcType::UInt64,
            other => return Err(NetcdfError::Malformed(format!("unknown nc_type {}", other))),
        })
    }

    fn size(self) -> u64 {
        match self {
            NcType::Byte | NcType::Char | NcType::UByte => 1,
            NcType::Short | NcType::UShort => 2,
            NcType::Int | NcType::UInt | NcType::Float => 4,
            NcType::Double | NcType::Int64 | NcType::UInt64 => 8,
        }
    }

    /// CDL type name, used as the declared field type in dataset schemas.
    pub fn name(self) -> &'static str {
        match self {
            NcType::Byte => "byte",
            NcType::Char => "char",
            NcType::Short => "short",
            NcType::Int => "int",
            NcType::Float => "float",
            NcType::Double => "double",
            NcType::UByte => "ubyte",
            NcType::UShort => "ushort",
            NcType::UInt => "uint",
            NcType::Int64 => "int64",
            NcType::UInt64 => "uint64",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dimension {
    pub name: String,
    /// Zero for the record (unlimited) dimension.
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
    pub nc_type: NcType,
    pub dimensions: Vec<String>,
    /// Text attributes of the variable (`units`, `long_name`, ...).
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub num_records: Option<u64>,
    pub dimensions: Vec<Dimension>,
    pub variables: Vec<Variable>,
    /// Global attributes of type `char`; numeric attributes are skipped.
    pub attributes: BTreeMap<String, String>,
}

impl Header {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// True when `bytes` starts with a NetCDF classic magic number.
pub fn is_netcdf(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && &bytes[..3] == b"CDF" && matches!(bytes[3], 1 | 2 | 5)
}

pub fn parse_header(bytes: &[u8]) -> Result<Header, NetcdfError> {
    if bytes.len() < 4 || &bytes[..3] != b"CDF" {
        return Err(NetcdfError::BadMagic);
    }
    let version = bytes[3];
    if !matches!(version, 1 | 2 | 5) {
        return Err(NetcdfError::UnsupportedVersion(version));
    }

    let mut cur = Cursor {
        buf: bytes,
        pos: 4,
        wide_counts: version == 5,
    };

    let num_records = if version == 5 {
        let n = cur.u64()?;
        (n != u64::MAX).then_some(n)
    } else {
        let n = cur.u32()?;
        (n != u32::MAX).then_some(n as u64)
    };

    let dimensions = read_dimensions(&mut cur)?;
    let attributes = read_attributes(&mut cur)?;
    let variables = read_variables(&mut cur, &dimensions, version)?;

    Ok(Header {
        version,
        num_records,
        dimensions,
        variables,
        attributes,
    })
}

fn read_dimensions(cur: &mut Cursor<'_>) -> Result<Vec<Dimension>, NetcdfError> {
    let count = cur.list_header(NC_DIMENSION)?;
    let mut dims = Vec::new();
    for _ in 0..count {
        let name = cur.name()?;
        let length = cur.count()?;
        dims.push(Dimension { name, length });
    }
    Ok(dims)
}

fn read_attributes(cur: &mut Cursor<'_>) -> Result<BTreeMap<String, String>, NetcdfError> {
    let count = cur.list_header(NC_ATTRIBUTE)?;
    let mut attrs = BTreeMap::new();
    for _ in 0..count {
        let name = cur.name()?;
        let nc_type = NcType::from_code(cur.u32()?)?;
        let nelems = cur.count()?;
        let len = nelems
            .checked_mul(nc_type.size())
            .ok_or_else(|| NetcdfError::Malformed(format!("attribute '{}' too large", name)))?;
        let raw = cur.padded(len)?;
        if nc_type == NcType::Char {
            let text = String::from_utf8_lossy(raw);
            attrs.insert(name, text.trim_end_matches('\0').to_string());
        }
    }
    Ok(attrs)
}

fn read_variables(
    cur: &mut Cursor<'_>,
    dims: &[Dimension],
    version: u8,
) -> Result<Vec<Variable>, NetcdfError> {
    let count = cur.list_header(NC_VARIABLE)?;
    let mut vars = Vec::new();
    for _ in 0..count {
        let name = cur.name()?;
        let ndims = cur.count()?;
        let mut dimensions = Vec::new();
        for _ in 0..ndims {
            let id = cur.count()?;
            let dim = dims.get(id as usize).ok_or_else(|| {
                NetcdfError::Malformed(format!("variable '{}' references dimension {}", name, id))
            })?;
            dimensions.push(dim.name.clone());
        }
        let attributes = read_attributes(cur)?;
        let nc_type = NcType::from_code(cur.u32()?)?;
        // vsize, then begin.
        cur.count()?;
        if version == 1 {
            cur.u32()?;
        } else {
            cur.u64()?;
        }
        vars.push(Variable {
            name,
            nc_type,
            dimensions,
            attributes,
        });
    }
    Ok(vars)
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    /// CDF-5 uses 64-bit counts and lengths.
    wide_counts: bool,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], NetcdfError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or(NetcdfError::Truncated(self.pos))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, NetcdfError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, NetcdfError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    fn count(&mut self) -> Result<u64, NetcdfError> {
        if self.wide_counts {
            self.u64()
        } else {
            self.u32().map(u64::from)
        }
    }

    /// `len` bytes followed by padding to the next 4-byte boundary.
    fn padded(&mut self, len: u64) -> Result<&'a [u8], NetcdfError> {
        let len = usize::try_from(len).map_err(|_| NetcdfError::Truncated(self.pos))?;
        let data = self.take(len)?;
        let pad = (4 - len % 4) % 4;
        self.take(pad)?;
        Ok(data)
    }

    fn name(&mut self) -> Result<String, NetcdfError> {
        let len = self.count()?;
        let raw = self.padded(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| NetcdfError::Malformed("name is not valid UTF-8".into()))
    }

    /// Element count of a tagged list; ABSENT yields zero.
    fn list_header(&mut self, expected: u32) -> Result<u64, NetcdfError> {
        let tag = self.u32()?;
        let count = self.count()?;
        match tag {
            0 if count == 0 => Ok(0),
            t if t == expected => Ok(count),
            t => Err(NetcdfError::Malformed(format!(
                "expected list tag {:#x}, found {:#x}",
                expected, t
            ))),
        }
    }
}
