use micro_transport::memory::{Cursor, MemoryBlock};

#[derive(Debug, Copy, Clone)]
pub struct TestCase {
    name: &'static str,
    block_size: usize,
    file: TestFile,
}

impl TestCase {
    pub fn new(name: &'static str, block_size: usize, file: TestFile) -> Self {
        Self { name, block_size, file }
    }

    /// The whole file in one block.
    pub fn contiguous(name: &'static str, file: TestFile) -> Self {
        Self::new(name, file.content().len().max(1), file)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn file(&self) -> &TestFile {
        &self.file
    }

    pub fn file_name(&self) -> &'static str {
        self.file().file_name
    }

    pub fn chain(&self) -> BlockChain {
        BlockChain::split(self.file.content().as_bytes(), self.block_size)
    }
}

#[derive(Debug, Copy, Clone)]
pub struct TestFile {
    file_name: &'static str,
    content: &'static str,
}

impl TestFile {
    pub const fn new(file_name: &'static str, content: &'static str) -> Self {
        Self { file_name, content }
    }

    pub fn content(&self) -> &'static str {
        self.content
    }

    pub fn file_name(&self) -> &'static str {
        self.file_name
    }
}

/// Unpooled blocks holding a file, linked in order.
#[derive(Debug)]
pub struct BlockChain {
    blocks: Vec<MemoryBlock>,
}

impl BlockChain {
    pub fn split(content: &[u8], block_size: usize) -> Self {
        let mut blocks: Vec<MemoryBlock> = content.chunks(block_size.max(1)).map(MemoryBlock::from_slice).collect();
        if blocks.is_empty() {
            blocks.push(MemoryBlock::from_slice(&[]));
        }
        for pair in blocks.windows(2) {
            pair[0].set_next(pair[1].clone());
        }
        Self { blocks }
    }

    pub fn start(&self) -> Cursor {
        self.blocks.first().map(Cursor::at_start).unwrap_or_default()
    }

    pub fn end(&self) -> Cursor {
        self.blocks.last().map(Cursor::at_end).unwrap_or_default()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}
