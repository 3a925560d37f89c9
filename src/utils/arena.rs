// A bump allocator for posting slabs. Memory is only returned by `reset`,
// which drops every chunk at once.

const CHUNK_BITS: u32 = 16;
pub const CHUNK_SIZE: usize = 1 << CHUNK_BITS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaAddr(u32);

impl ArenaAddr {
    pub const NULL: ArenaAddr = ArenaAddr(u32::MAX);

    fn new(chunk: usize, offset: usize) -> Self {
        ArenaAddr(((chunk as u32) << CHUNK_BITS) | offset as u32)
    }

    fn chunk(self) -> usize {
        (self.0 >> CHUNK_BITS) as usize
    }

    fn offset(self) -> usize {
        (self.0 & ((1 << CHUNK_BITS) - 1)) as usize
    }

    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }

    pub fn from_raw(raw: u32) -> Self {
        ArenaAddr(raw)
    }
}

pub struct PostingArena {
    chunks: Vec<Box<[u8]>>,
    used: usize,
}

impl PostingArena {
    pub fn new() -> Self {
        Self {
            chunks: Vec::new(),
            used: CHUNK_SIZE,
        }
    }

    /// Allocates `len` zeroed bytes that never straddle a chunk.
    pub fn alloc(&mut self, len: usize) -> ArenaAddr {
        assert!(len > 0 && len <= CHUNK_SIZE);
        if self.used + len > CHUNK_SIZE {
            self.chunks.push(vec![0u8; CHUNK_SIZE].into_boxed_slice());
            self.used = 0;
        }
        let addr = ArenaAddr::new(self.chunks.len() - 1, self.used);
        self.used += len;
        addr
    }

    pub fn slice(&self, addr: ArenaAddr, len: usize) -> &[u8] {
        &self.chunks[addr.chunk()][addr.offset()..addr.offset() + len]
    }

    pub fn slice_mut(&mut self, addr: ArenaAddr, len: usize) -> &mut [u8] {
        &mut self.chunks[addr.chunk()][addr.offset()..addr.offset() + len]
    }

    /// Releases every chunk; previously returned addresses become invalid.
    pub fn reset(&mut self) {
        self.chunks = Vec::new();
        self.used = CHUNK_SIZE;
    }

    pub fn allocated_bytes(&self) -> usize {
        self.chunks.len() * CHUNK_SIZE
    }
}
