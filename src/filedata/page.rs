/// One resident unit of file data: a flat buffer plus a dirty flag.
///
/// A page may hold fewer bytes than the manager's page size only when it
/// is the last page of the file or the file is being extended into it;
/// interior pages are always full.
pub struct Page {
    data: Vec<u8>,
    dirty: bool,
}

impl Page {
    /// Wraps a buffer handed out by the [`super::CachingAllocator`].
    pub(crate) fn from_buffer(data: Vec<u8>) -> Self {
        Self { data, dirty: false }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    /// Resizes in place: shrinking preserves the prefix, growing
    /// zero-fills the extension. Capacity is retained on shrink.
    pub fn resize(&mut self, len: usize) {
        if len >= self.data.len() {
            self.data.resize(len, 0);
        } else {
            self.data.truncate(len);
        }
    }

    /// Consumes the page, returning its buffer for recycling.
    pub(crate) fn into_buffer(self) -> Vec<u8> {
        self.data
    }
}
