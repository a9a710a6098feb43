//! The session-state blob: versioned state round-tripped through the client.
//!
//! The backend writes the blob into every session response; the client
//! echoes it back untouched in the next session update. The blob is opaque
//! to the client. Versions grow by appending gated fields — the read window
//! is 8..=13 so a backend can be rolled forward while year-old SDK builds
//! keep replaying blobs minted by older backends.

use crate::route::RouteState;
use crate::stream::{ReadStream, Stream, WireError, WriteStream};
use crate::wire::MAX_SESSION_DATA_BYTES;

/// Version written into fresh blobs.
pub const SESSION_DATA_VERSION: u32 = 13;

/// Oldest blob version still accepted.
pub const SESSION_DATA_MIN_VERSION: u32 = 8;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionData {
    pub version: u32,
    pub session_id: u64,
    pub slice_number: u32,
    pub expire_timestamp: u64,
    /// Route revision counter; bumps every time a new route is issued.
    pub session_version: u8,
    pub route_state: RouteState,
    // Version 9: envelope accounting.
    pub envelope_bytes_up_sum: u64,
    pub envelope_bytes_down_sum: u64,
    // Version 10: session wall-clock tracking.
    pub session_duration: u32,
    pub start_timestamp: u64,
    // Version 11: time actually spent accelerated.
    pub duration_on_next: u32,
    // Version 12: accumulated client event bits.
    pub session_events: u64,
    // Version 13: post-session summary already published.
    pub summary_written: bool,
}

impl SessionData {
    pub fn serialize<S: Stream>(&mut self, stream: &mut S) -> Result<(), WireError> {
        let mut version = self.version;
        stream.serialize_bits(&mut version, 8)?;
        if version < SESSION_DATA_MIN_VERSION || version > SESSION_DATA_VERSION {
            return Err(WireError::UnsupportedVersion {
                version,
                min: SESSION_DATA_MIN_VERSION,
                max: SESSION_DATA_VERSION,
            });
        }
        self.version = version;

        stream.serialize_u64(&mut self.session_id)?;
        stream.serialize_u32(&mut self.slice_number)?;
        stream.serialize_u64(&mut self.expire_timestamp)?;
        stream.serialize_u8(&mut self.session_version)?;
        self.route_state.serialize(stream)?;

        if version >= 9 {
            stream.serialize_u64(&mut self.envelope_bytes_up_sum)?;
            stream.serialize_u64(&mut self.envelope_bytes_down_sum)?;
        }
        if version >= 10 {
            stream.serialize_u32(&mut self.session_duration)?;
            stream.serialize_u64(&mut self.start_timestamp)?;
        }
        if version >= 11 {
            stream.serialize_u32(&mut self.duration_on_next)?;
        }
        if version >= 12 {
            stream.serialize_u64(&mut self.session_events)?;
        }
        if version >= 13 {
            stream.serialize_bool(&mut self.summary_written)?;
        }
        Ok(())
    }

    /// True while the blob's expiry has not passed.
    pub fn fresh(&self, now: u64) -> bool {
        self.expire_timestamp > now
    }
}

/// Encode a blob at the current version.
pub fn write_session_data(data: &SessionData) -> Result<Vec<u8>, WireError> {
    let mut copy = data.clone();
    copy.version = SESSION_DATA_VERSION;
    let mut stream = WriteStream::with_capacity(MAX_SESSION_DATA_BYTES);
    copy.serialize(&mut stream)?;
    let bytes = stream.finish();
    if bytes.len() > MAX_SESSION_DATA_BYTES {
        return Err(WireError::TooLong { len: bytes.len(), max: MAX_SESSION_DATA_BYTES });
    }
    Ok(bytes)
}

/// Decode a blob of any accepted version.
pub fn read_session_data(bytes: &[u8]) -> Result<SessionData, WireError> {
    if bytes.is_empty() || bytes.len() > MAX_SESSION_DATA_BYTES {
        return Err(WireError::TooShort { len: bytes.len(), min: 1 });
    }
    let mut stream = ReadStream::new(bytes);
    let mut data = SessionData::default();
    data.serialize(&mut stream)?;
    Ok(data)
}
