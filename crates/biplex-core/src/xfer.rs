//! Transfer filters and the filter pipe.
//!
//! A transfer filter is a byte-to-byte transform applied to the framed
//! payload, identified by a single byte. Filters stack: the pipe carries the
//! ids outermost first, and the id list travels verbatim on the wire so the
//! receiver can apply the inverse stack.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, OnceLock};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::RwLock;

use crate::error::FilterError;

/// Maximum number of filter ids in one pipe.
pub const MAX_PIPE_LEN: usize = 255;

/// Id of the built-in gzip filter.
pub const GZIP_FILTER_ID: u8 = b'g';

/// A byte-to-byte payload transform identified by a 1-byte id.
pub trait XferFilter: Send + Sync + 'static {
    fn id(&self) -> u8;
    fn name(&self) -> &'static str;
    /// Applied on the send path.
    fn on_pack(&self, data: &[u8]) -> Result<Vec<u8>, FilterError>;
    /// Applied on the receive path; must invert [`XferFilter::on_pack`].
    fn on_unpack(&self, data: &[u8]) -> Result<Vec<u8>, FilterError>;
}

/// Gzip compression filter.
pub struct GzipFilter {
    level: Compression,
}

impl GzipFilter {
    /// `level` is the flate2 compression level, 0..=9.
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level),
        }
    }
}

impl XferFilter for GzipFilter {
    fn id(&self) -> u8 {
        GZIP_FILTER_ID
    }

    fn name(&self) -> &'static str {
        "gzip"
    }

    fn on_pack(&self, data: &[u8]) -> Result<Vec<u8>, FilterError> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), self.level);
        encoder.write_all(data).map_err(|e| FilterError::Apply {
            name: "gzip",
            message: e.to_string(),
        })?;
        encoder.finish().map_err(|e| FilterError::Apply {
            name: "gzip",
            message: e.to_string(),
        })
    }

    fn on_unpack(&self, data: &[u8]) -> Result<Vec<u8>, FilterError> {
        let mut out = Vec::with_capacity(data.len() * 2);
        GzDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| FilterError::Apply {
                name: "gzip",
                message: e.to_string(),
            })?;
        Ok(out)
    }
}

/// A scoped transfer-filter registry; same discipline as the codec registry.
#[derive(Clone, Default)]
pub struct XferRegistry {
    inner: Arc<RwLock<HashMap<u8, Arc<dyn XferFilter>>>>,
}

impl XferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with gzip at level 5.
    pub fn with_defaults() -> Self {
        let reg = Self::new();
        reg.register(Arc::new(GzipFilter::new(5))).expect("fresh registry");
        reg
    }

    pub fn register(&self, filter: Arc<dyn XferFilter>) -> Result<(), FilterError> {
        let id = filter.id();
        let mut map = self.inner.write();
        if map.contains_key(&id) {
            return Err(FilterError::AlreadyRegistered(id));
        }
        map.insert(id, filter);
        Ok(())
    }

    pub fn get(&self, id: u8) -> Result<Arc<dyn XferFilter>, FilterError> {
        self.inner
            .read()
            .get(&id)
            .cloned()
            .ok_or(FilterError::Unknown(id))
    }
}

/// The process-wide filter registry, preloaded with gzip level 5.
pub fn global() -> &'static XferRegistry {
    static GLOBAL: OnceLock<XferRegistry> = OnceLock::new();
    GLOBAL.get_or_init(XferRegistry::with_defaults)
}

/// Register a filter in the process-wide registry.
///
/// # Panics
///
/// Panics if the id is already taken.
pub fn register(filter: Arc<dyn XferFilter>) {
    if let Err(e) = global().register(filter) {
        panic!("{e}");
    }
}

/// An ordered stack of transfer filters, outermost first.
///
/// On the send path the filters run from the last id to the first, so the
/// outermost filter is the last to touch the wire bytes; the receive path
/// runs them first to last, inverting the stack.
#[derive(Clone, Default)]
pub struct XferPipe {
    filters: Vec<Arc<dyn XferFilter>>,
}

impl XferPipe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a filter by id, resolving it against `registry`.
    pub fn append(&mut self, registry: &XferRegistry, id: u8) -> Result<(), FilterError> {
        let filter = registry.get(id)?;
        self.append_filter(filter)
    }

    pub fn append_filter(&mut self, filter: Arc<dyn XferFilter>) -> Result<(), FilterError> {
        if self.filters.len() >= MAX_PIPE_LEN {
            return Err(FilterError::PipeOverflow(self.filters.len() + 1));
        }
        self.filters.push(filter);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn reset(&mut self) {
        self.filters.clear();
    }

    /// The id list as it travels on the wire.
    pub fn ids(&self) -> Vec<u8> {
        self.filters.iter().map(|f| f.id()).collect()
    }

    pub fn on_pack(&self, data: Vec<u8>) -> Result<Vec<u8>, FilterError> {
        let mut data = data;
        for filter in self.filters.iter().rev() {
            data = filter.on_pack(&data)?;
        }
        Ok(data)
    }

    pub fn on_unpack(&self, data: Vec<u8>) -> Result<Vec<u8>, FilterError> {
        let mut data = data;
        for filter in &self.filters {
            data = filter.on_unpack(&data)?;
        }
        Ok(data)
    }
}

impl std::fmt::Debug for XferPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("XferPipe").field(&self.ids()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_symmetry() {
        let filter = GzipFilter::new(5);
        let inputs: [&[u8]; 3] = [b"", b"hello", &[0u8; 4096]];
        for input in inputs {
            let packed = filter.on_pack(input).unwrap();
            assert_eq!(filter.on_unpack(&packed).unwrap(), input);
        }
    }

    #[test]
    fn gzip_rejects_garbage() {
        let filter = GzipFilter::new(5);
        assert!(matches!(
            filter.on_unpack(b"this is not gzip"),
            Err(FilterError::Apply { name: "gzip", .. })
        ));
    }

    #[test]
    fn append_unknown_id_fails() {
        let reg = XferRegistry::new();
        let mut pipe = XferPipe::new();
        assert!(matches!(
            pipe.append(&reg, 0xFF),
            Err(FilterError::Unknown(0xFF))
        ));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let reg = XferRegistry::with_defaults();
        assert!(matches!(
            reg.register(Arc::new(GzipFilter::new(9))),
            Err(FilterError::AlreadyRegistered(GZIP_FILTER_ID))
        ));
    }

    #[test]
    fn pipe_applies_outermost_last_on_pack() {
        // Two marker filters that tag the data with their id; the first
        // (outermost) id must end up as the outermost tag.
        struct Tag(u8);
        impl XferFilter for Tag {
            fn id(&self) -> u8 {
                self.0
            }
            fn name(&self) -> &'static str {
                "tag"
            }
            fn on_pack(&self, data: &[u8]) -> Result<Vec<u8>, FilterError> {
                let mut out = vec![self.0];
                out.extend_from_slice(data);
                Ok(out)
            }
            fn on_unpack(&self, data: &[u8]) -> Result<Vec<u8>, FilterError> {
                match data.split_first() {
                    Some((&first, rest)) if first == self.0 => Ok(rest.to_vec()),
                    _ => Err(FilterError::Apply {
                        name: "tag",
                        message: "tag mismatch".into(),
                    }),
                }
            }
        }

        let mut pipe = XferPipe::new();
        pipe.append_filter(Arc::new(Tag(1))).unwrap();
        pipe.append_filter(Arc::new(Tag(2))).unwrap();

        let packed = pipe.on_pack(b"x".to_vec()).unwrap();
        assert_eq!(packed, vec![1, 2, b'x']);
        assert_eq!(pipe.on_unpack(packed).unwrap(), b"x");
    }

    #[test]
    fn pipe_roundtrip_through_registry() {
        let reg = XferRegistry::with_defaults();
        let mut pipe = XferPipe::new();
        pipe.append(&reg, GZIP_FILTER_ID).unwrap();
        assert_eq!(pipe.ids(), vec![GZIP_FILTER_ID]);

        let data = b"the same bytes come back".to_vec();
        let packed = pipe.on_pack(data.clone()).unwrap();
        assert_ne!(packed, data);
        assert_eq!(pipe.on_unpack(packed).unwrap(), data);
    }
}
