//! Session handshake serialization.
//!
//! Before any work is submitted, the host sends a single `OpenSession` command describing the
//! execution context the worker needs: bound query parameters, compiled predicate/projection
//! code, the transaction snapshot, the session timezone and the database encoding.
//!
//! # Layout
//!
//! The payload is a fixed header, followed by one offset slot per query parameter, followed by
//! a trailer of blobs. Every offset is a byte position inside the payload; `0` means absent (or
//! NULL for parameters), which is unambiguous because the header always occupies the start.
//!
//! ```text
//! +--------------------------------------+ 0
//! | nparams, kcxt_extra_bufsz,           |
//! | kcxt_kvars_nslots,                   |
//! | xact_start_timestamp,                |
//! | 5 blob offsets                       |
//! +--------------------------------------+ SESSION_HEADER_SIZE
//! | poffset[0..nparams]                  |
//! +--------------------------------------+ session_fixed_size(nparams)
//! | blobs, in the order they were built  |
//! +--------------------------------------+
//! ```
//!
//! Parameter values of fixed-width types are stored as their raw bytes; variable-length values,
//! code blobs, the transaction id vector, the timezone and the encoding descriptor are stored
//! with a 4-byte big-endian total size in front (see
//! [`BinaryBuffer::append_sized`](crate::buffer::BinaryBuffer::append_sized)).
use std::fmt;

use bincode::{Decode, Encode, decode_from_slice, encode_into_slice, encode_to_vec};
use log::debug;
use thiserror::Error;

use crate::{
    HostError,
    buffer::{BinaryBuffer, BufferError, Offset, read_sized},
    protocol::{Command, CommandError, CommandTag, wire_config},
};

pub const SESSION_HEADER_SIZE: usize = 40;
const POFFSET_SIZE: usize = size_of::<u32>();

/// Size of the header plus the parameter offset slots.
pub fn session_fixed_size(nparams: u32) -> usize {
    SESSION_HEADER_SIZE + POFFSET_SIZE * nparams as usize
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no value found for parameter {id}: {source}")]
    Resolve {
        id: u32,
        #[source]
        source: HostError,
    },

    #[error(
        "type of parameter {id} ({actual}) does not match that when preparing the plan ({expected})"
    )]
    TypeMismatch {
        id: u32,
        expected: TypeDesc,
        actual: TypeDesc,
    },

    #[error("parameter {id} is out of range; the query has {nparams} parameters")]
    ParamOutOfRange { id: u32, nparams: u32 },

    #[error("not a supported data type for kernel parameter {id}: {type_desc}")]
    UnsupportedType { id: u32, type_desc: TypeDesc },

    #[error("parameter {id} value has {actual} bytes, type requires {expected}")]
    ValueLength {
        id: u32,
        expected: usize,
        actual: usize,
    },

    #[error("session payload needs {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("{field} offset {offset} is outside the session trailer")]
    BadOffset { field: String, offset: u32 },

    #[error("{field} at offset {offset} overlaps another blob")]
    Overlap { field: String, offset: u32 },

    #[error("session stores a value for parameter {id} the plan does not use")]
    UnknownParam { id: u32 },

    #[error("expected an OpenSession command, got {0:?}")]
    NotSession(CommandTag),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("failed to encode session: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("failed to decode session: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

/// Storage class of a type, as far as parameter serialization cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeClass {
    /// Fixed width, passed by value.
    ByValue(usize),
    /// Fixed width, passed by reference.
    ByReference(usize),
    /// Variable length with a size header.
    VarLena,
    /// Any other storage class (e.g. null-terminated strings); cannot be sent to a worker.
    Unsupported(i16),
}

impl TypeClass {
    /// Classifies a type from its catalog length and by-value flag.
    pub fn from_typlen(typlen: i16, byval: bool) -> Self {
        match typlen {
            -1 => TypeClass::VarLena,
            n if n > 0 && byval => TypeClass::ByValue(n as usize),
            n if n > 0 => TypeClass::ByReference(n as usize),
            n => TypeClass::Unsupported(n),
        }
    }

    fn fixed_len(self) -> Option<usize> {
        match self {
            TypeClass::ByValue(n) | TypeClass::ByReference(n) => Some(n),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDesc {
    pub oid: u32,
    pub name: String,
    pub class: TypeClass,
}

impl TypeDesc {
    pub fn new(oid: u32, name: impl Into<String>, class: TypeClass) -> Self {
        Self {
            oid,
            name: name.into(),
            class,
        }
    }
}

impl fmt::Display for TypeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [oid {}]", self.name, self.oid)
    }
}

/// A parameter referenced by the plan, with the type it was planned with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryParam {
    pub id: u32,
    pub type_desc: TypeDesc,
}

/// Current value of a parameter as evaluated by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedParam {
    /// Runtime type of the value.
    pub type_desc: TypeDesc,
    /// Raw bytes, `None` for NULL. Variable-length values are already detoasted.
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct EncodingInfo {
    pub name: String,
    pub max_len: i32,
}

/// Host-side collaborator providing everything the handshake carries.
pub trait SessionHost {
    fn resolve_parameter(&mut self, param: &QueryParam) -> Result<ResolvedParam, HostError>;

    /// Transaction ids visible to the current transaction; empty for none.
    fn transaction_ids(&self) -> Vec<u32>;

    /// Transaction start time in microseconds.
    fn transaction_start(&self) -> i64;

    /// Serialized session timezone, if one is set.
    fn timezone(&self) -> Option<Vec<u8>>;

    fn encoding(&self) -> EncodingInfo;
}

/// Plan-side inputs to [`build_session_command`].
#[derive(Debug, Clone, Default)]
pub struct SessionRequest<'a> {
    /// Number of parameter slots, used or not.
    pub nparams: u32,
    /// Parameters the plan actually references; every `id` must be below `nparams`.
    pub used_params: &'a [QueryParam],
    pub kcxt_extra_bufsz: u32,
    pub kcxt_kvars_nslots: u32,
    pub scan_quals: Option<&'a [u8]>,
    pub scan_projs: Option<&'a [u8]>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionHeader {
    pub nparams: u32,
    pub kcxt_extra_bufsz: u32,
    pub kcxt_kvars_nslots: u32,
    pub xact_start_timestamp: i64,
    pub xpucode_scan_quals: Offset,
    pub xpucode_scan_projs: Offset,
    pub xact_id_array: Offset,
    pub session_timezone: Offset,
    pub session_encode: Offset,
}

#[derive(Encode, Decode)]
struct RawSessionHeader {
    nparams: u32,
    kcxt_extra_bufsz: u32,
    kcxt_kvars_nslots: u32,
    xact_start_timestamp: i64,
    xpucode_scan_quals: u32,
    xpucode_scan_projs: u32,
    xact_id_array: u32,
    session_timezone: u32,
    session_encode: u32,
}

impl From<&SessionHeader> for RawSessionHeader {
    fn from(h: &SessionHeader) -> Self {
        Self {
            nparams: h.nparams,
            kcxt_extra_bufsz: h.kcxt_extra_bufsz,
            kcxt_kvars_nslots: h.kcxt_kvars_nslots,
            xact_start_timestamp: h.xact_start_timestamp,
            xpucode_scan_quals: h.xpucode_scan_quals.to_wire(),
            xpucode_scan_projs: h.xpucode_scan_projs.to_wire(),
            xact_id_array: h.xact_id_array.to_wire(),
            session_timezone: h.session_timezone.to_wire(),
            session_encode: h.session_encode.to_wire(),
        }
    }
}

impl From<RawSessionHeader> for SessionHeader {
    fn from(r: RawSessionHeader) -> Self {
        Self {
            nparams: r.nparams,
            kcxt_extra_bufsz: r.kcxt_extra_bufsz,
            kcxt_kvars_nslots: r.kcxt_kvars_nslots,
            xact_start_timestamp: r.xact_start_timestamp,
            xpucode_scan_quals: Offset::from_wire(r.xpucode_scan_quals),
            xpucode_scan_projs: Offset::from_wire(r.xpucode_scan_projs),
            xact_id_array: Offset::from_wire(r.xact_id_array),
            session_timezone: Offset::from_wire(r.session_timezone),
            session_encode: Offset::from_wire(r.session_encode),
        }
    }
}

/// Builds the `OpenSession` command for a scan.
///
/// The header is only fully known once every blob has been appended, so a zeroed placeholder is
/// reserved first and overwritten at the end.
pub fn build_session_command(
    request: &SessionRequest<'_>,
    host: &mut dyn SessionHost,
) -> Result<Command, SessionError> {
    let nparams = request.nparams;
    let fixed = session_fixed_size(nparams);
    let mut buf = BinaryBuffer::new();
    buf.append_zero(fixed)?;

    let mut header = SessionHeader {
        nparams,
        ..Default::default()
    };
    let mut poffset = vec![Offset::ABSENT; nparams as usize];

    if let Some(code) = request.scan_quals {
        header.xpucode_scan_quals = Offset::from_wire(buf.append_sized(code)?);
    }
    if let Some(code) = request.scan_projs {
        header.xpucode_scan_projs = Offset::from_wire(buf.append_sized(code)?);
    }

    for param in request.used_params {
        if param.id >= nparams {
            return Err(SessionError::ParamOutOfRange {
                id: param.id,
                nparams,
            });
        }
        poffset[param.id as usize] = append_param(&mut buf, param, host)?;
    }

    let xids = host.transaction_ids();
    if !xids.is_empty() {
        let bytes: Vec<u8> = xids.iter().flat_map(|x| x.to_be_bytes()).collect();
        header.xact_id_array = Offset::from_wire(buf.append_sized(&bytes)?);
    }
    if let Some(tz) = host.timezone() {
        header.session_timezone = Offset::from_wire(buf.append_sized(&tz)?);
    }
    let encoding = encode_to_vec(host.encoding(), wire_config())?;
    header.session_encode = Offset::from_wire(buf.append_sized(&encoding)?);

    header.kcxt_extra_bufsz = request.kcxt_extra_bufsz;
    header.kcxt_kvars_nslots = request.kcxt_kvars_nslots;
    header.xact_start_timestamp = host.transaction_start();

    let mut fixed_bytes = vec![0_u8; fixed];
    encode_into_slice(
        RawSessionHeader::from(&header),
        &mut fixed_bytes[..SESSION_HEADER_SIZE],
        wire_config(),
    )?;
    for (slot, offset) in fixed_bytes[SESSION_HEADER_SIZE..]
        .chunks_exact_mut(POFFSET_SIZE)
        .zip(&poffset)
    {
        slot.copy_from_slice(&offset.to_wire().to_be_bytes());
    }
    buf.overwrite(0, &fixed_bytes)?;

    debug!(
        "session built: {} params ({} used), {} bytes",
        nparams,
        request.used_params.len(),
        buf.len()
    );
    Ok(Command::new(CommandTag::OpenSession, buf.as_slice())?)
}

fn append_param(
    buf: &mut BinaryBuffer,
    param: &QueryParam,
    host: &mut dyn SessionHost,
) -> Result<Offset, SessionError> {
    let resolved = host
        .resolve_parameter(param)
        .map_err(|source| SessionError::Resolve {
            id: param.id,
            source,
        })?;
    if resolved.type_desc.oid != param.type_desc.oid {
        return Err(SessionError::TypeMismatch {
            id: param.id,
            expected: param.type_desc.clone(),
            actual: resolved.type_desc,
        });
    }

    let Some(value) = resolved.value else {
        return Ok(Offset::ABSENT);
    };
    let offset = match param.type_desc.class {
        TypeClass::ByValue(len) | TypeClass::ByReference(len) => {
            if value.len() != len {
                return Err(SessionError::ValueLength {
                    id: param.id,
                    expected: len,
                    actual: value.len(),
                });
            }
            buf.append(&value)?
        }
        TypeClass::VarLena => buf.append_sized(&value)?,
        TypeClass::Unsupported(_) => {
            return Err(SessionError::UnsupportedType {
                id: param.id,
                type_desc: param.type_desc.clone(),
            });
        }
    };
    Ok(Offset::from_wire(offset))
}

/// A decoded `OpenSession` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub header: SessionHeader,
    pub poffset: Vec<Offset>,
    /// Parameter values indexed by parameter id; `None` for NULL or unused.
    pub params: Vec<Option<Vec<u8>>>,
    pub scan_quals: Option<Vec<u8>>,
    pub scan_projs: Option<Vec<u8>>,
    pub xact_ids: Vec<u32>,
    pub timezone: Option<Vec<u8>>,
    pub encoding: Option<EncodingInfo>,
}

impl SessionInfo {
    /// Decodes the payload of an `OpenSession` command.
    pub fn from_command(command: &Command, params: &[QueryParam]) -> Result<Self, SessionError> {
        match command.tag() {
            CommandTag::OpenSession => Self::decode(command.payload(), params),
            other => Err(SessionError::NotSession(other)),
        }
    }

    /// Decodes a session payload, checking that every blob lies inside the trailer and that no
    /// two blobs overlap. `params` supplies the storage class of each parameter id.
    pub fn decode(payload: &[u8], params: &[QueryParam]) -> Result<Self, SessionError> {
        if payload.len() < SESSION_HEADER_SIZE {
            return Err(SessionError::Truncated {
                needed: SESSION_HEADER_SIZE,
                got: payload.len(),
            });
        }
        let (raw, _): (RawSessionHeader, usize) =
            decode_from_slice(&payload[..SESSION_HEADER_SIZE], wire_config())?;
        let header = SessionHeader::from(raw);

        let fixed = session_fixed_size(header.nparams);
        if payload.len() < fixed {
            return Err(SessionError::Truncated {
                needed: fixed,
                got: payload.len(),
            });
        }
        let poffset: Vec<Offset> = payload[SESSION_HEADER_SIZE..fixed]
            .chunks_exact(POFFSET_SIZE)
            .map(|b| Offset::from_wire(u32::from_be_bytes([b[0], b[1], b[2], b[3]])))
            .collect();

        let mut trailer = Trailer {
            payload,
            fixed,
            extents: Vec::new(),
        };

        let scan_quals = trailer.sized("xpucode_scan_quals", header.xpucode_scan_quals)?;
        let scan_projs = trailer.sized("xpucode_scan_projs", header.xpucode_scan_projs)?;

        let mut values = Vec::with_capacity(poffset.len());
        for (id, offset) in poffset.iter().enumerate() {
            let id = id as u32;
            if offset.is_absent() {
                values.push(None);
                continue;
            }
            let param = params
                .iter()
                .find(|p| p.id == id)
                .ok_or(SessionError::UnknownParam { id })?;
            let field = format!("poffset[{id}]");
            let value = match param.type_desc.class.fixed_len() {
                Some(len) => trailer.fixed(&field, *offset, len)?,
                None => trailer.sized(&field, *offset)?,
            };
            values.push(value);
        }

        let xact_ids = trailer
            .sized("xact_id_array", header.xact_id_array)?
            .map(|bytes| {
                bytes
                    .chunks_exact(size_of::<u32>())
                    .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
                    .collect()
            })
            .unwrap_or_default();
        let timezone = trailer.sized("session_timezone", header.session_timezone)?;
        let encoding = match trailer.sized("session_encode", header.session_encode)? {
            Some(bytes) => {
                let (encoding, _): (EncodingInfo, usize) =
                    decode_from_slice(&bytes, wire_config())?;
                Some(encoding)
            }
            None => None,
        };

        trailer.check_overlap()?;

        Ok(Self {
            header,
            poffset,
            params: values,
            scan_quals,
            scan_projs,
            xact_ids,
            timezone,
            encoding,
        })
    }
}

/// Bounds-checked access to the blob region of a session payload.
struct Trailer<'a> {
    payload: &'a [u8],
    fixed: usize,
    extents: Vec<(usize, usize, String)>,
}

impl Trailer<'_> {
    fn fixed(&mut self, field: &str, offset: Offset, len: usize) -> Result<Option<Vec<u8>>, SessionError> {
        let Some(start) = offset.get() else {
            return Ok(None);
        };
        let begin = start as usize;
        let end = begin + len;
        if begin < self.fixed || end > self.payload.len() {
            return Err(SessionError::BadOffset {
                field: field.to_string(),
                offset: start,
            });
        }
        self.extents.push((begin, end, field.to_string()));
        Ok(Some(self.payload[begin..end].to_vec()))
    }

    fn sized(&mut self, field: &str, offset: Offset) -> Result<Option<Vec<u8>>, SessionError> {
        let Some(start) = offset.get() else {
            return Ok(None);
        };
        let bad = || SessionError::BadOffset {
            field: field.to_string(),
            offset: start,
        };
        if (start as usize) < self.fixed {
            return Err(bad());
        }
        let blob = read_sized(self.payload, start).ok_or_else(bad)?;
        let begin = start as usize;
        let end = begin + crate::buffer::SIZE_PREFIX + blob.len();
        self.extents.push((begin, end, field.to_string()));
        Ok(Some(blob.to_vec()))
    }

    fn check_overlap(&mut self) -> Result<(), SessionError> {
        self.extents.sort_by_key(|(begin, _, _)| *begin);
        for pair in self.extents.windows(2) {
            let (_, prev_end, _) = &pair[0];
            let (begin, _, field) = &pair[1];
            if begin < prev_end {
                return Err(SessionError::Overlap {
                    field: field.clone(),
                    offset: *begin as u32,
                });
            }
        }
        Ok(())
    }
}
