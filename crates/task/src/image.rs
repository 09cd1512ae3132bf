//! User program images.
//!
//! An image is a flat binary with a 20 byte header in front of the text and
//! data payloads. The loader places text at [`USER_IMAGE_BASE`], follows it
//! with the writable data and zeroed bss, and puts the stack at the top of
//! the user half. There is no relocation; images are linked for this layout.

use alloc::vec::Vec;
use core::fmt;

use vmm::{PAGE_SIZE, VirtualAddress};

/// Lowest virtual address of a user image's text.
pub const USER_IMAGE_BASE: usize = 0x0010_0000;
/// One past the highest user stack address. The stack grows down from here.
pub const USER_STACK_TOP: usize = 0x8000_0000;
/// Pages mapped for each user stack.
pub const USER_STACK_PAGES: usize = 8;

const MAGIC: [u8; 4] = *b"VIMG";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageError {
    /// Shorter than the fixed header.
    TooShort,
    /// The first four bytes are not the image magic.
    BadMagic,
    /// The header promises more text or data than the image contains.
    TruncatedPayload,
    /// The entry point lies outside the text segment.
    EntryOutsideText,
    /// The entry point is not instruction aligned.
    MisalignedEntry,
    /// Text, data and bss together do not leave room for the stack.
    TooLarge,
    /// An image with this name is already registered.
    DuplicateName,
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort => write!(f, "image shorter than its header"),
            Self::BadMagic => write!(f, "bad image magic"),
            Self::TruncatedPayload => write!(f, "image payload truncated"),
            Self::EntryOutsideText => write!(f, "entry point outside text"),
            Self::MisalignedEntry => write!(f, "entry point not 4 byte aligned"),
            Self::TooLarge => write!(f, "image does not fit the user address space"),
            Self::DuplicateName => write!(f, "image name already registered"),
        }
    }
}

/// Decoded image header. All fields are little endian on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageHeader {
    /// Entry point, relative to the start of text.
    pub entry_offset: u32,
    /// Bytes of executable text following the header.
    pub text_size: u32,
    /// Bytes of initialised data following the text.
    pub data_size: u32,
    /// Bytes of zero-initialised memory after the data.
    pub bss_size: u32,
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

impl ImageHeader {
    /// Bytes occupied by the encoded header.
    pub const SIZE: usize = 20;

    /// Validates and decodes the header at the front of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self, ImageError> {
        if bytes.len() < Self::SIZE {
            return Err(ImageError::TooShort);
        }
        if bytes[..4] != MAGIC {
            return Err(ImageError::BadMagic);
        }
        let header = Self {
            entry_offset: read_u32(bytes, 4),
            text_size: read_u32(bytes, 8),
            data_size: read_u32(bytes, 12),
            bss_size: read_u32(bytes, 16),
        };
        let payload = Self::SIZE as u64 + header.text_size as u64 + header.data_size as u64;
        if payload > bytes.len() as u64 {
            return Err(ImageError::TruncatedPayload);
        }
        if header.entry_offset >= header.text_size {
            return Err(ImageError::EntryOutsideText);
        }
        if header.entry_offset % 4 != 0 {
            return Err(ImageError::MisalignedEntry);
        }
        let span = (header.text_page_count() + header.rw_page_count()) as u64 * PAGE_SIZE as u64;
        let stack = (USER_STACK_PAGES * PAGE_SIZE) as u64;
        if USER_IMAGE_BASE as u64 + span > USER_STACK_TOP as u64 - stack {
            return Err(ImageError::TooLarge);
        }
        Ok(header)
    }

    /// Pages needed for the text mapping.
    pub fn text_page_count(&self) -> usize {
        (self.text_size as usize).div_ceil(PAGE_SIZE)
    }

    /// Pages needed for the data plus bss mapping.
    pub fn rw_page_count(&self) -> usize {
        (self.data_size as usize + self.bss_size as usize).div_ceil(PAGE_SIZE)
    }
}

/// A registered image: validated header plus borrowed payload bytes.
#[derive(Clone, Copy, Debug)]
pub struct Image {
    name: &'static str,
    header: ImageHeader,
    bytes: &'static [u8],
}

impl Image {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    /// The executable payload.
    pub fn text(&self) -> &'static [u8] {
        &self.bytes[ImageHeader::SIZE..][..self.header.text_size as usize]
    }

    /// The initialised data payload.
    pub fn data(&self) -> &'static [u8] {
        &self.bytes[ImageHeader::SIZE + self.header.text_size as usize..]
            [..self.header.data_size as usize]
    }

    /// Where execution starts once the image is mapped.
    pub fn entry_address(&self) -> VirtualAddress {
        VirtualAddress::new(USER_IMAGE_BASE + self.header.entry_offset as usize)
    }
}

/// The set of user programs the kernel can spawn, registered at boot from
/// binaries linked into the kernel.
#[derive(Debug, Default)]
pub struct ImageRegistry {
    images: Vec<Image>,
}

impl ImageRegistry {
    pub const fn new() -> Self {
        Self { images: Vec::new() }
    }

    /// Validates `bytes` and registers it under `name`. Rejects the image
    /// outright if the header is malformed, so a spawn can never see an
    /// invalid image.
    pub fn register(&mut self, name: &'static str, bytes: &'static [u8]) -> Result<(), ImageError> {
        let header = ImageHeader::parse(bytes)?;
        if self.get(name).is_some() {
            return Err(ImageError::DuplicateName);
        }
        log::debug!(
            "registered image {name:?}: {} bytes text, {} data, {} bss",
            header.text_size,
            header.data_size,
            header.bss_size
        );
        self.images.push(Image {
            name,
            header,
            bytes,
        });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Image> {
        self.images.iter().find(|image| image.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Image> {
        self.images.iter()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}
