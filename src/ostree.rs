use byteorder::{ByteOrder, LittleEndian, NativeEndian};
use log::debug;
use memmap2::Mmap;
use std::collections::HashMap;
use std::fs;
use std::num::NonZeroUsize;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::str;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OstreeError {
    #[error("No such ref: {0}")]
    NoSuchRef(String),
    #[error("No such commit: {0}")]
    NoSuchCommit(String),
    #[error("No repository at {0:?}")]
    NoSuchRepo(PathBuf),
    #[error("Invalid utf8 string")]
    InvalidUtf8,
    #[error("Command {0} failed to start: {1}")]
    ExecFailed(String, String),
    #[error("Command {0} exited unsucessfully with stderr: {1}")]
    CommandFailed(String, String),
    #[error("Commit is already signed with key {0}")]
    AlreadySigned(String),
    #[error("No transaction in progress")]
    NoTransaction,
    #[error("A transaction is already in progress")]
    TransactionInProgress,
    #[error("Internal Error: {0}")]
    InternalError(String),
}

pub type OstreeResult<T> = Result<T, OstreeError>;

impl From<std::io::Error> for OstreeError {
    fn from(e: std::io::Error) -> Self {
        OstreeError::InternalError(e.to_string())
    }
}

/// A decoded GVariant value, as stored in commit metadata.
///
/// Container variants carry their element type so empty containers keep
/// their full type.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    Bool(bool),
    Byte(u8),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Handle(i32),
    Double(f64),
    String(String),
    ObjectPath(String),
    Signature(String),
    Variant(Box<MetadataValue>),
    Maybe(String, Option<Box<MetadataValue>>),
    Array(String, Vec<MetadataValue>),
    Tuple(Vec<MetadataValue>),
    DictEntry(Box<MetadataValue>, Box<MetadataValue>),
}

impl MetadataValue {
    pub fn type_string(&self) -> String {
        match self {
            MetadataValue::Bool(_) => "b".to_string(),
            MetadataValue::Byte(_) => "y".to_string(),
            MetadataValue::Int16(_) => "n".to_string(),
            MetadataValue::Uint16(_) => "q".to_string(),
            MetadataValue::Int32(_) => "i".to_string(),
            MetadataValue::Uint32(_) => "u".to_string(),
            MetadataValue::Int64(_) => "x".to_string(),
            MetadataValue::Uint64(_) => "t".to_string(),
            MetadataValue::Handle(_) => "h".to_string(),
            MetadataValue::Double(_) => "d".to_string(),
            MetadataValue::String(_) => "s".to_string(),
            MetadataValue::ObjectPath(_) => "o".to_string(),
            MetadataValue::Signature(_) => "g".to_string(),
            MetadataValue::Variant(_) => "v".to_string(),
            MetadataValue::Maybe(element, _) => format!("m{}", element),
            MetadataValue::Array(element, _) => format!("a{}", element),
            MetadataValue::Tuple(members) => format!(
                "({})",
                members.iter().map(|m| m.type_string()).collect::<String>()
            ),
            MetadataValue::DictEntry(key, value) => {
                format!("{{{}{}}}", key.type_string(), value.type_string())
            }
        }
    }

    /// Renders the value in GVariant text format with a leading type
    /// annotation, as accepted by `g_variant_parse()`.
    pub fn to_variant_text(&self) -> String {
        format!("@{} {}", self.type_string(), self.to_text())
    }

    fn to_text(&self) -> String {
        match self {
            MetadataValue::Bool(v) => v.to_string(),
            MetadataValue::Byte(v) => v.to_string(),
            MetadataValue::Int16(v) => v.to_string(),
            MetadataValue::Uint16(v) => v.to_string(),
            MetadataValue::Int32(v) | MetadataValue::Handle(v) => v.to_string(),
            MetadataValue::Uint32(v) => v.to_string(),
            MetadataValue::Int64(v) => v.to_string(),
            MetadataValue::Uint64(v) => v.to_string(),
            MetadataValue::Double(v) => format!("{:?}", v),
            MetadataValue::String(s) | MetadataValue::ObjectPath(s) | MetadataValue::Signature(s) => {
                quote(s)
            }
            MetadataValue::Variant(inner) => format!("<{}>", inner.to_variant_text()),
            MetadataValue::Maybe(_, None) => "nothing".to_string(),
            MetadataValue::Maybe(_, Some(inner)) => format!("just {}", inner.to_text()),
            MetadataValue::Array(_, elements) if elements.is_empty() => "[]".to_string(),
            MetadataValue::Array(element, elements) if element.starts_with('{') => {
                let entries: Vec<String> = elements
                    .iter()
                    .map(|e| match e {
                        MetadataValue::DictEntry(key, value) => {
                            format!("{}: {}", key.to_text(), value.to_text())
                        }
                        other => other.to_text(),
                    })
                    .collect();
                format!("{{{}}}", entries.join(", "))
            }
            MetadataValue::Array(_, elements) => format!(
                "[{}]",
                elements.iter().map(|e| e.to_text()).collect::<Vec<_>>().join(", ")
            ),
            MetadataValue::Tuple(members) => match members.len() {
                1 => format!("({},)", members[0].to_text()),
                _ => format!(
                    "({})",
                    members.iter().map(|m| m.to_text()).collect::<Vec<_>>().join(", ")
                ),
            },
            MetadataValue::DictEntry(key, value) => {
                format!("{{{}, {}}}", key.to_text(), value.to_text())
            }
        }
    }

    /// The elements of an `as` value.
    pub fn as_strings(&self) -> Option<Vec<String>> {
        match self {
            MetadataValue::Array(element, elements) if element == "s" => elements
                .iter()
                .map(|e| match e {
                    MetadataValue::String(s) => Some(s.clone()),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }
}

fn quote(s: &str) -> String {
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('\'');
    for c in s.chars() {
        match c {
            '\'' => quoted.push_str("\\'"),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            c if c.is_control() => quoted.push_str(&format!("\\u{:04x}", c as u32)),
            c => quoted.push(c),
        }
    }
    quoted.push('\'');
    quoted
}

fn bad_type(type_string: &str) -> OstreeError {
    OstreeError::InternalError(format!("Invalid variant type {:?}", type_string))
}

/// Returns the end of the complete type starting at `start`.
fn type_end(type_string: &str, start: usize) -> OstreeResult<usize> {
    let bytes = type_string.as_bytes();
    match bytes.get(start) {
        Some(b'a') | Some(b'm') => type_end(type_string, start + 1),
        Some(b'(') => {
            let mut next = start + 1;
            while bytes.get(next) != Some(&b')') {
                next = type_end(type_string, next)?;
            }
            Ok(next + 1)
        }
        Some(b'{') => {
            let value = type_end(type_string, start + 1)?;
            let end = type_end(type_string, value)?;
            if bytes.get(end) != Some(&b'}') {
                return Err(bad_type(type_string));
            }
            Ok(end + 1)
        }
        Some(c) if b"bynqiuxthdsogv".contains(c) => Ok(start + 1),
        _ => Err(bad_type(type_string)),
    }
}

/// The member types of a tuple or dict entry type.
fn member_types(type_string: &str) -> OstreeResult<Vec<&str>> {
    let inner = &type_string[1..type_string.len() - 1];
    let mut members = Vec::new();
    let mut start = 0;
    while start < inner.len() {
        let end = type_end(inner, start)?;
        members.push(&inner[start..end]);
        start = end;
    }
    Ok(members)
}

fn pad_to(offset: usize, alignment: usize) -> usize {
    (offset + alignment - 1) / alignment * alignment
}

/// Returns the alignment and, for fixed size types, the size of a single
/// complete type.
pub(crate) fn type_info(type_string: &str) -> OstreeResult<(usize, Option<usize>)> {
    if type_end(type_string, 0)? != type_string.len() {
        return Err(bad_type(type_string));
    }
    Ok(match type_string.as_bytes()[0] {
        b'b' | b'y' => (1, Some(1)),
        b'n' | b'q' => (2, Some(2)),
        b'i' | b'u' | b'h' => (4, Some(4)),
        b'x' | b't' | b'd' => (8, Some(8)),
        b's' | b'o' | b'g' => (1, None),
        b'v' => (8, None),
        b'a' | b'm' => (type_info(&type_string[1..])?.0, None),
        _ => {
            let mut alignment = 1;
            let mut size = Some(0);
            for member in member_types(type_string)? {
                let (member_alignment, member_size) = type_info(member)?;
                alignment = alignment.max(member_alignment);
                size = match (size, member_size) {
                    (Some(size), Some(member_size)) => {
                        Some(pad_to(size, member_alignment) + member_size)
                    }
                    _ => None,
                };
            }
            let size = size.map(|size| match size {
                0 => 1,
                size => pad_to(size, alignment),
            });
            (alignment, size)
        }
    })
}

#[derive(Debug)]
pub struct OstreeCommit {
    pub metadata: HashMap<String, MetadataValue>,
    pub subject: String,
    pub body: String,
    pub timestamp: u64,
}

/// The parts of a static delta bundle header the importer cares about.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaHeader {
    pub ref_name: String,
    pub commit: String,
    /// String valued entries of the superblock metadata dictionary.
    pub metadata: HashMap<String, String>,
}

impl DeltaHeader {
    /// The application metadata declared by the bundle, empty if absent.
    pub fn app_metadata(&self) -> &str {
        self.metadata.get("metadata").map(|s| s.as_str()).unwrap_or("")
    }
}

#[derive(Debug)]
enum VariantSize {
    Fixed(NonZeroUsize),
    Variable,
}

#[derive(Debug)]
struct VariantFieldInfo {
    size: VariantSize,
    alignment: usize,
}

impl VariantFieldInfo {
    fn variable(alignment: usize) -> Self {
        VariantFieldInfo {
            size: VariantSize::Variable,
            alignment,
        }
    }

    fn fixed(size: usize, alignment: usize) -> Self {
        VariantFieldInfo {
            size: NonZeroUsize::new(size)
                .map(VariantSize::Fixed)
                .unwrap_or(VariantSize::Variable),
            alignment,
        }
    }
}

#[derive(Debug)]
struct SubVariant<'a> {
    offset: usize,
    data: &'a [u8],
}

impl<'a> SubVariant<'a> {
    fn new(data: &'a [u8]) -> SubVariant<'a> {
        SubVariant { offset: 0, data }
    }

    fn framing_size(&self) -> usize {
        let len = self.data.len() as u64;
        if len == 0 {
            0
        } else if len <= u8::MAX as u64 {
            1
        } else if len <= u16::MAX as u64 {
            2
        } else if len <= u32::MAX as u64 {
            4
        } else {
            8
        }
    }

    fn read_frame_offset(&self, offset: usize, framing_size: usize) -> OstreeResult<usize> {
        if offset + framing_size > self.data.len() {
            return Err(OstreeError::InternalError(format!(
                "Framing error: can't read frame offset at {}",
                offset
            )));
        }
        let data = &self.data[offset..offset + framing_size];
        let offset = match framing_size {
            0 => 0,
            1 => usize::from(data[0]),
            2 => usize::from(LittleEndian::read_u16(data)),
            4 => LittleEndian::read_u32(data) as usize,
            8 => {
                let len64 = LittleEndian::read_u64(data);
                if len64 > usize::MAX as u64 {
                    return Err(OstreeError::InternalError(
                        "Framing error: To large framing size fror usize".to_string(),
                    ));
                }
                len64 as usize
            }
            _ => {
                return Err(OstreeError::InternalError(format!(
                    "Framing error: Unexpected framing size {}",
                    framing_size
                )))
            }
        };
        if offset > self.data.len() {
            return Err(OstreeError::InternalError(format!(
                "Framing error: out of bounds offset at {}",
                offset
            )));
        };
        Ok(offset)
    }

    fn pad(&self, cur: usize, alignment: usize) -> usize {
        if alignment == 0 {
            cur
        } else {
            let offset = cur + self.offset;
            cur + (alignment - (offset % alignment)) % alignment
        }
    }

    fn subset(&self, start: usize, end: usize) -> OstreeResult<SubVariant<'a>> {
        if end < start || end > self.data.len() {
            return Err(OstreeError::InternalError(format!(
                "Framing error: subset {}-{} out of bounds for {} bytes",
                start,
                end,
                self.data.len()
            )));
        }
        Ok(SubVariant {
            offset: start + self.offset,
            data: &self.data[start..end],
        })
    }

    fn checked_sub(&self, a: usize, b: usize) -> OstreeResult<usize> {
        if b > a {
            Err(OstreeError::InternalError(
                "Framing error: negative checked_sub".to_string(),
            ))
        } else {
            Ok(a - b)
        }
    }

    fn parse_as_tuple(&self, fields: &[VariantFieldInfo]) -> OstreeResult<Vec<SubVariant<'a>>> {
        let mut result = Vec::new();

        let framing_size = self.framing_size();
        let mut frame_offset = self.data.len();

        let mut next: usize = 0;
        for (i, field) in fields.iter().enumerate() {
            next = self.pad(next, field.alignment);

            let field_size = match field.size {
                VariantSize::Fixed(size) => usize::from(size),
                VariantSize::Variable => {
                    let end = if i == fields.len() - 1 {
                        frame_offset
                    } else {
                        frame_offset = self.checked_sub(frame_offset, framing_size)?;
                        self.read_frame_offset(frame_offset, framing_size)?
                    };
                    self.checked_sub(end, next)?
                }
            };

            let sub = self.subset(next, next + field_size)?;
            result.push(sub);
            next += field_size;
        }

        Ok(result)
    }

    /* Arrays of variable sized elements store the end offset of every
     * element after the elements, with the last offset pointing at the
     * start of that offset table. */
    fn parse_as_variable_array(&self, alignment: usize) -> OstreeResult<Vec<SubVariant<'a>>> {
        let mut result = Vec::new();
        if self.data.is_empty() {
            return Ok(result);
        }

        let framing_size = self.framing_size();
        let last_end =
            self.read_frame_offset(self.checked_sub(self.data.len(), framing_size)?, framing_size)?;
        let offsets_size = self.checked_sub(self.data.len(), last_end)?;
        if offsets_size % framing_size != 0 {
            return Err(OstreeError::InternalError(
                "Framing error: misaligned array offsets".to_string(),
            ));
        }

        let mut start = 0;
        for i in 0..offsets_size / framing_size {
            let end = self.read_frame_offset(last_end + i * framing_size, framing_size)?;
            start = self.pad(start, alignment);
            result.push(self.subset(start, end)?);
            start = end;
        }

        Ok(result)
    }

    /// Splits a serialized `v` into its type string and value.
    fn parse_as_variant(&self) -> OstreeResult<(String, SubVariant<'a>)> {
        let sep = self
            .data
            .iter()
            .rposition(|b| *b == 0)
            .ok_or_else(|| OstreeError::InternalError("Variant without type".to_string()))?;
        let type_string = str::from_utf8(&self.data[sep + 1..])
            .map_err(|_e| OstreeError::InvalidUtf8)?
            .to_string();
        Ok((type_string, self.subset(0, sep)?))
    }

    fn parse_as_metadata_dict(&self) -> OstreeResult<HashMap<String, MetadataValue>> {
        let entry_fields = [VariantFieldInfo::variable(0), VariantFieldInfo::variable(8)];
        let mut dict = HashMap::new();
        for entry in self.parse_as_variable_array(8)? {
            let parts = entry.parse_as_tuple(&entry_fields)?;
            let key = parts[0].parse_as_string()?;
            let (type_string, value) = parts[1].parse_as_variant()?;
            dict.insert(key, value.parse_as_value(&type_string)?);
        }
        Ok(dict)
    }

    fn parse_as_fixed(&self, size: usize) -> OstreeResult<&'a [u8]> {
        if self.data.len() != size {
            return Err(OstreeError::InternalError(format!(
                "Wrong length {} for {} byte value",
                self.data.len(),
                size
            )));
        }
        Ok(self.data)
    }

    /// Decodes a value of any complete type.
    fn parse_as_value(&self, type_string: &str) -> OstreeResult<MetadataValue> {
        let (_, fixed_size) = type_info(type_string)?;
        let value = match type_string.as_bytes()[0] {
            b'b' => MetadataValue::Bool(self.parse_as_fixed(1)?[0] != 0),
            b'y' => MetadataValue::Byte(self.parse_as_fixed(1)?[0]),
            b'n' => MetadataValue::Int16(NativeEndian::read_i16(self.parse_as_fixed(2)?)),
            b'q' => MetadataValue::Uint16(NativeEndian::read_u16(self.parse_as_fixed(2)?)),
            b'i' => MetadataValue::Int32(NativeEndian::read_i32(self.parse_as_fixed(4)?)),
            b'u' => MetadataValue::Uint32(NativeEndian::read_u32(self.parse_as_fixed(4)?)),
            b'h' => MetadataValue::Handle(NativeEndian::read_i32(self.parse_as_fixed(4)?)),
            b'x' => MetadataValue::Int64(NativeEndian::read_i64(self.parse_as_fixed(8)?)),
            b't' => MetadataValue::Uint64(self.parse_as_u64()?),
            b'd' => MetadataValue::Double(NativeEndian::read_f64(self.parse_as_fixed(8)?)),
            b's' => MetadataValue::String(self.parse_as_string()?),
            b'o' => MetadataValue::ObjectPath(self.parse_as_string()?),
            b'g' => MetadataValue::Signature(self.parse_as_string()?),
            b'v' => {
                let (inner_type, inner) = self.parse_as_variant()?;
                MetadataValue::Variant(Box::new(inner.parse_as_value(&inner_type)?))
            }
            b'm' => {
                let element = &type_string[1..];
                let inner = if self.data.is_empty() {
                    None
                } else {
                    // Variable sized children carry a trailing nul
                    let end = match type_info(element)?.1 {
                        Some(_) => self.data.len(),
                        None => self.data.len() - 1,
                    };
                    Some(Box::new(self.subset(0, end)?.parse_as_value(element)?))
                };
                MetadataValue::Maybe(element.to_string(), inner)
            }
            b'a' => {
                let element = &type_string[1..];
                let (alignment, element_size) = type_info(element)?;
                let children = match element_size {
                    Some(size) => {
                        if self.data.len() % size != 0 {
                            return Err(OstreeError::InternalError(format!(
                                "Framing error: array of {} is {} bytes",
                                element,
                                self.data.len()
                            )));
                        }
                        (0..self.data.len() / size)
                            .map(|i| self.subset(i * size, (i + 1) * size))
                            .collect::<OstreeResult<Vec<_>>>()?
                    }
                    None => self.parse_as_variable_array(alignment)?,
                };
                MetadataValue::Array(
                    element.to_string(),
                    children
                        .iter()
                        .map(|c| c.parse_as_value(element))
                        .collect::<OstreeResult<Vec<_>>>()?,
                )
            }
            _ => {
                if let Some(size) = fixed_size {
                    self.parse_as_fixed(size)?;
                }
                let members = member_types(type_string)?;
                let fields = members
                    .iter()
                    .map(|m| {
                        type_info(m).map(|(alignment, size)| match size {
                            Some(size) => VariantFieldInfo::fixed(size, alignment),
                            None => VariantFieldInfo::variable(alignment),
                        })
                    })
                    .collect::<OstreeResult<Vec<_>>>()?;
                let mut values = self
                    .parse_as_tuple(&fields)?
                    .iter()
                    .zip(members.iter())
                    .map(|(part, member)| part.parse_as_value(member))
                    .collect::<OstreeResult<Vec<_>>>()?;
                if type_string.starts_with('{') {
                    let value = values.pop().ok_or_else(|| bad_type(type_string))?;
                    let key = values.pop().ok_or_else(|| bad_type(type_string))?;
                    MetadataValue::DictEntry(Box::new(key), Box::new(value))
                } else {
                    MetadataValue::Tuple(values)
                }
            }
        };
        Ok(value)
    }

    /// Parses an `a{sv}`, keeping only the string typed values.
    fn parse_as_string_dict(&self) -> OstreeResult<HashMap<String, String>> {
        Ok(self
            .parse_as_metadata_dict()?
            .into_iter()
            .filter_map(|(key, value)| match value {
                MetadataValue::String(s) => Some((key, s)),
                other => {
                    debug!("Skipping metadata key {} of type {:?}", key, other);
                    None
                }
            })
            .collect())
    }

    fn parse_as_string(&self) -> OstreeResult<String> {
        let data = self.data.strip_suffix(&[0]).unwrap_or(self.data);
        str::from_utf8(data)
            .map(|s| s.to_string())
            .map_err(|_e| OstreeError::InvalidUtf8)
    }

    fn parse_as_bytes(&self) -> &'a [u8] {
        self.data
    }

    fn parse_as_u64(&self) -> OstreeResult<u64> {
        if self.data.len() != 8 {
            return Err(OstreeError::InternalError(format!(
                "Wrong length {} for u64",
                self.data.len()
            )));
        }
        Ok(NativeEndian::read_u64(self.data))
    }
}

fn bytes_to_object(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

pub fn is_checksum(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase())
}

fn get_ref_path(repo_path: &Path) -> PathBuf {
    repo_path.join("refs/heads")
}

fn get_object_path(repo_path: &Path, object: &str, object_type: &str) -> PathBuf {
    repo_path
        .join("objects")
        .join(&object[0..2])
        .join(format!("{}.{}", &object[2..], object_type))
}

pub fn get_commit(repo_path: &Path, commit: &str) -> OstreeResult<OstreeCommit> {
    if !is_checksum(commit) {
        return Err(OstreeError::NoSuchCommit(commit.to_string()));
    }
    let contents = fs::read(get_object_path(repo_path, commit, "commit"))
        .map_err(|_e| OstreeError::NoSuchCommit(commit.to_string()))?;

    let ostree_commit_fields = [
        // 0 - a{sv} - Metadata
        VariantFieldInfo::variable(8),
        // 1 - ay - parent checksum (empty string for initial)
        VariantFieldInfo::variable(0),
        // 2- a(say) - Related objects
        VariantFieldInfo::variable(0),
        // 3 - s - subject
        VariantFieldInfo::variable(0),
        // 4- s - body
        VariantFieldInfo::variable(0),
        // 5- t - Timestamp in seconds since the epoch (UTC, big-endian)
        VariantFieldInfo::fixed(8, 8),
        // 6- ay - Root tree contents
        VariantFieldInfo::variable(0),
        // 7- ay - Root tree metadata
        VariantFieldInfo::variable(0),
    ];

    let container = SubVariant::new(&contents);
    let fields = container.parse_as_tuple(&ostree_commit_fields)?;

    Ok(OstreeCommit {
        metadata: fields[0].parse_as_metadata_dict()?,
        subject: fields[3].parse_as_string()?,
        body: fields[4].parse_as_string()?,
        timestamp: u64::from_be(fields[5].parse_as_u64()?),
    })
}

pub fn parse_delta_superblock(data: &[u8]) -> OstreeResult<DeltaHeader> {
    let superblock_fields = [
        // 0 - a{sv} - Metadata
        VariantFieldInfo::variable(8),
        // 1 - t - Timestamp
        VariantFieldInfo::fixed(8, 8),
        // 2 - ay - From checksum (empty for a full delta)
        VariantFieldInfo::variable(0),
        // 3 - ay - To checksum
        VariantFieldInfo::variable(0),
        // 4 - (a{sv}aya(say)sstayay) - The commit object
        VariantFieldInfo::variable(8),
        // 5 - ay - Prerequisite deltas
        VariantFieldInfo::variable(0),
        // 6 - a(uayttay) - Part headers
        VariantFieldInfo::variable(8),
        // 7 - a(yaytt) - Fallback objects
        VariantFieldInfo::variable(8),
    ];

    let container = SubVariant::new(data);
    let fields = container.parse_as_tuple(&superblock_fields)?;

    let to = fields[3].parse_as_bytes();
    if to.len() != 32 {
        return Err(OstreeError::InternalError(format!(
            "Invalid delta target checksum length {}",
            to.len()
        )));
    }

    let metadata = fields[0].parse_as_string_dict()?;
    let ref_name = metadata
        .get("ref")
        .cloned()
        .ok_or_else(|| OstreeError::InternalError("Bundle header has no ref".to_string()))?;

    Ok(DeltaHeader {
        ref_name,
        commit: bytes_to_object(to),
        metadata,
    })
}

/// Reads the header of a flatpak bundle. The file is mapped rather than
/// read, since only the superblock framing and metadata are touched.
pub fn read_delta_superblock(path: &Path) -> OstreeResult<DeltaHeader> {
    let file = fs::File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Err(OstreeError::InternalError(format!(
            "{:?} is empty",
            path.file_name().unwrap_or_default()
        )));
    }
    // Uploads are private to the server and never modified while mapped
    let data = unsafe { Mmap::map(&file)? };
    parse_delta_superblock(&data)
}

pub fn parse_ref(repo_path: &Path, ref_name: &str) -> OstreeResult<String> {
    let commit = fs::read_to_string(get_ref_path(repo_path).join(ref_name))
        .map_err(|_e| OstreeError::NoSuchRef(ref_name.to_string()))?
        .trim_end()
        .to_string();
    Ok(commit)
}

pub fn list_refs(repo_path: &Path, prefix: &str) -> Vec<String> {
    let path_prefix = get_ref_path(repo_path);
    let ref_dir = path_prefix.join(prefix);

    WalkDir::new(&ref_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| !e.file_type().is_dir())
        .filter_map(|e| e.path().strip_prefix(&path_prefix).map(|p| p.to_path_buf()).ok())
        .filter_map(|p| p.to_str().map(|s| s.to_string()))
        .collect()
}

/// Finds the repository in an extracted archive, either at the top level or
/// in the first child directory.
pub fn find_repo(start_path: &Path) -> OstreeResult<PathBuf> {
    if get_ref_path(start_path).is_dir() {
        debug!("Found refs in toplevel dir");
        return Ok(start_path.to_path_buf());
    }

    let mut children = fs::read_dir(start_path)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect::<Vec<_>>();
    children.sort();

    if let Some(first) = children.into_iter().next() {
        if get_ref_path(&first).is_dir() {
            debug!("Found refs in first child dir");
            return Ok(first);
        }
    }

    Err(OstreeError::InternalError(
        "Repo did not have the expected layout".to_string(),
    ))
}

fn command_name(cmd: &Command) -> String {
    let mut name = cmd.get_program().to_string_lossy().to_string();
    if let Some(subcommand) = cmd
        .get_args()
        .map(|a| a.to_string_lossy())
        .find(|a| !a.starts_with('-'))
    {
        name.push(' ');
        name.push_str(&subcommand);
    }
    name
}

/// Runs a command to completion and returns its output, failing if it
/// can't be started or exits unsuccessfully.
pub fn run_command(cmd: &mut Command) -> OstreeResult<Output> {
    let name = command_name(cmd);
    debug!("Executing {:?}", cmd);

    let output = unsafe {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .pre_exec(|| {
                // Setsid in the child to avoid SIGINT on server killing
                // child and breaking the graceful shutdown
                libc::setsid();
                Ok(())
            })
            .output()
            .map_err(|e| OstreeError::ExecFailed(name.clone(), e.to_string()))?
    };

    if !output.status.success() {
        return Err(OstreeError::CommandFailed(
            name,
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    Ok(output)
}
