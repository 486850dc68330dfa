//! Region file format storing up to 32x32 chunk payloads inside a single file, split 
//! in 4 KiB sectors. The two first sectors are the header: one sector range per slot
//! then one timestamp per slot.

use std::io::{self, Read, Seek, SeekFrom, Take, Write};
use std::time::{SystemTime, UNIX_EPOCH};
use std::path::Path;
use std::fs::File;

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::io::{ReadWireExt, WriteWireExt};

use super::RegionError;


/// Size of a sector in the region file.
const SECTOR_SIZE: u64 = 4096;
/// Number of chunk slots in a region file.
const SLOT_COUNT: usize = 1024;
/// Sectors holding the location table then the timestamp table.
const HEADER_SECTORS: u32 = 2;
/// The sector count of a location is a single byte.
const MAX_SLOT_SECTORS: u32 = 0xFF;
/// Compression identifiers in a slot payload header.
const COMPRESSION_GZIP: u8 = 1;
const COMPRESSION_ZLIB: u8 = 2;

const EMPTY_SECTOR: &[u8; SECTOR_SIZE as usize] = &[0; SECTOR_SIZE as usize];


/// Header index of the slot holding chunk `cx/cz`, Z major. Coordinates are masked to
/// the region, so world chunk coordinates can be given directly.
#[inline]
fn calc_slot_index(cx: i32, cz: i32) -> usize {
    ((cz & 31) as usize) * 32 + (cx & 31) as usize
}

/// A handle to an opened region file.
pub struct RegionFile {
    file: File,
    /// Slot headers, identical to the ones on disk after every write.
    slots: Box<[SlotHeader; SLOT_COUNT]>,
    sectors: SectorMap,
}

impl RegionFile {

    /// Open a region file, every inconsistency in the header is reported without 
    /// altering the file. If `create` is true, a missing or empty file is initialized
    /// with an empty header.
    pub fn open<P: AsRef<Path>>(path: P, create: bool) -> Result<Self, RegionError> {

        let mut file = File::options()
            .read(true)
            .write(true)
            .create(create)
            .open(path)?;

        let file_len = file.seek(SeekFrom::End(0))?;

        if file_len == 0 && create {
            file.write_all(EMPTY_SECTOR)?;
            file.write_all(EMPTY_SECTOR)?;
        } else if file_len < HEADER_SECTORS as u64 * SECTOR_SIZE {
            return Err(RegionError::FileTooSmall(file_len));
        } else if file_len % SECTOR_SIZE != 0 {
            return Err(RegionError::FileNotPadded(file_len));
        }

        let file_sectors = (file_len / SECTOR_SIZE).max(HEADER_SECTORS as u64) as u32;
        let mut slots = Box::new([SlotHeader::EMPTY; SLOT_COUNT]);
        let mut sectors = SectorMap::new(file_sectors);

        file.seek(SeekFrom::Start(0))?;

        for slot in slots.iter_mut() {
            slot.range = SectorRange::from_raw(file.read_int()? as u32);
            if !slot.range.is_empty() {
                // Payloads can neither overlap the header nor point past the file end.
                if slot.range.offset < HEADER_SECTORS || slot.range.end() > file_sectors {
                    return Err(RegionError::IllegalRange);
                }
                sectors.mark(slot.range, true);
            }
        }

        for slot in slots.iter_mut() {
            slot.timestamp = file.read_int()? as u32;
        }

        Ok(Self {
            file,
            slots,
            sectors,
        })

    }

    /// Return true if the given slot has a payload stored in this file.
    pub fn contains_chunk(&self, cx: i32, cz: i32) -> bool {
        !self.slots[calc_slot_index(cx, cz)].range.is_empty()
    }

    /// Read the payload at the given slot, the chunk coordinates can be given as world
    /// chunk coordinates, only their position modulo 32 is relevant.
    pub fn read_chunk(&mut self, cx: i32, cz: i32) -> Result<ChunkReader<'_>, RegionError> {

        let slot = self.slots[calc_slot_index(cx, cz)];
        if slot.range.is_empty() {
            return Err(RegionError::EmptyChunk);
        }

        self.file.seek(SeekFrom::Start(slot.range.offset as u64 * SECTOR_SIZE))?;

        // The declared length counts the compression byte and must fit the range.
        let len = self.file.read_int()?;
        if len < 1 || len as u64 + 4 > slot.range.count as u64 * SECTOR_SIZE {
            return Err(RegionError::IllegalRange);
        }

        let compression = self.file.read_ubyte()?;
        let data = Read::take(&mut self.file, len as u64 - 1);

        let inner = match compression {
            COMPRESSION_GZIP => ChunkReaderInner::Gz(GzDecoder::new(data)),
            COMPRESSION_ZLIB => ChunkReaderInner::Zlib(ZlibDecoder::new(data)),
            _ => return Err(RegionError::IllegalCompression),
        };

        Ok(ChunkReader { inner })

    }

    /// Start writing the payload of the given slot, the payload is only committed to
    /// the file when calling [`ChunkWriter::flush_chunk`].
    pub fn write_chunk(&mut self, cx: i32, cz: i32) -> ChunkWriter<'_> {
        ChunkWriter { 
            cx, 
            cz, 
            encoder: ZlibEncoder::new(Vec::new(), Compression::default()), 
            region: self,
        }
    }

    /// Store a slot header in cache and in both header tables of the file.
    fn store_slot(&mut self, index: usize, slot: SlotHeader) -> io::Result<()> {
        self.slots[index] = slot;
        self.file.seek(SeekFrom::Start(index as u64 * 4))?;
        self.file.write_int(slot.range.to_raw() as i32)?;
        self.file.seek(SeekFrom::Start(SECTOR_SIZE + index as u64 * 4))?;
        self.file.write_int(slot.timestamp as i32)?;
        Ok(())
    }

    fn write_chunk_data(&mut self, cx: i32, cz: i32, compression: u8, data: &[u8]) -> Result<(), RegionError> {
 
        // 4 bytes of length and 1 byte of compression precede the payload.
        let written = 5 + data.len() as u64;
        let count = written.div_ceil(SECTOR_SIZE);
        if count > MAX_SLOT_SECTORS as u64 {
            return Err(RegionError::OutOfSector);
        }
        let count = count as u32;

        let index = calc_slot_index(cx, cz);
        let mut slot = self.slots[index];

        if count <= slot.range.count {
            self.sectors.mark(SectorRange { offset: slot.range.offset + count, count: slot.range.count - count }, false);
            slot.range.count = count;
        } else {
            self.sectors.mark(slot.range, false);
            slot.range = self.sectors.allocate(count);
        }

        slot.timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);

        self.store_slot(index, slot)?;

        self.file.seek(SeekFrom::Start(slot.range.offset as u64 * SECTOR_SIZE))?;
        self.file.write_int(data.len() as i32 + 1)?;
        self.file.write_ubyte(compression)?;
        self.file.write_all(data)?;

        // Zero the tail of the last sector, the file length stays sector aligned.
        let padding = count as u64 * SECTOR_SIZE - written;
        self.file.write_all(&EMPTY_SECTOR[..padding as usize])?;
        self.file.flush()?;

        Ok(())

    }

}


/// Allocation state of every sector of a region file, one bit per sector. The header
/// sectors are always allocated, sectors past the tracked length are free.
struct SectorMap {
    words: Vec<u64>,
}

impl SectorMap {

    fn new(sector_count: u32) -> Self {
        let mut map = Self { words: vec![0; (sector_count as usize).div_ceil(64)] };
        map.mark(SectorRange { offset: 0, count: HEADER_SECTORS }, true);
        map
    }

    #[inline]
    fn is_allocated(&self, sector: u32) -> bool {
        self.words.get(sector as usize / 64).is_some_and(|word| word & (1u64 << (sector % 64)) != 0)
    }

    fn mark(&mut self, range: SectorRange, allocated: bool) {
        for sector in range.offset..range.end() {
            let word = sector as usize / 64;
            if word >= self.words.len() {
                self.words.resize(word + 1, 0);
            }
            if allocated {
                self.words[word] |= 1u64 << (sector % 64);
            } else {
                self.words[word] &= !(1u64 << (sector % 64));
            }
        }
    }

    /// Allocate the first run of `count` free sectors. When no tracked run is long 
    /// enough, the run starts at the last free tail and grows the file.
    fn allocate(&mut self, count: u32) -> SectorRange {

        let tracked = self.words.len() as u32 * 64;
        let mut start = HEADER_SECTORS;

        for sector in HEADER_SECTORS..tracked {
            if self.is_allocated(sector) {
                start = sector + 1;
            } else if sector + 1 - start == count {
                break;
            }
        }

        let range = SectorRange { offset: start, count };
        self.mark(range, true);
        range

    }

}


/// A handle for reading a chunk payload from a region file.
pub struct ChunkReader<'region> {
    inner: ChunkReaderInner<'region>,
}

/// The actual implementation of the chunk reader depending on the compression type.
enum ChunkReaderInner<'region> {
    Gz(GzDecoder<Take<&'region mut File>>),
    Zlib(ZlibDecoder<Take<&'region mut File>>),
}

impl Read for ChunkReader<'_> {

    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            ChunkReaderInner::Gz(gz) => gz.read(buf),
            ChunkReaderInner::Zlib(zlib) => zlib.read(buf),
        }
    }

}


/// A handle for writing a chunk payload in a region file.
pub struct ChunkWriter<'region> {
    cx: i32,
    cz: i32,
    /// Payloads are always written with zlib compression.
    encoder: ZlibEncoder<Vec<u8>>,
    region: &'region mut RegionFile,
}

impl ChunkWriter<'_> {

    /// Finish compression and commit the payload to the region file, allocating
    /// sectors as needed.
    pub fn flush_chunk(self) -> Result<(), RegionError> {
        let data = self.encoder.finish()?;
        self.region.write_chunk_data(self.cx, self.cz, COMPRESSION_ZLIB, &data)
    }

}

impl Write for ChunkWriter<'_> {

    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.encoder.write(buf)
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        self.encoder.flush()
    }

}


/// Cached header of a slot.
#[derive(Debug, Clone, Copy)]
struct SlotHeader {
    /// Sectors used by the slot payload, empty if the slot has no payload.
    range: SectorRange,
    /// Time when the slot was last written, in seconds since Unix epoch.
    timestamp: u32,
}

impl SlotHeader {
    const EMPTY: Self = Self { range: SectorRange { offset: 0, count: 0 }, timestamp: 0 };
}

/// A contiguous range of sectors, stored on disk as `offset << 8 | count`.
#[derive(Debug, Clone, Copy, Default)]
struct SectorRange {
    offset: u32,
    count: u32,
}

impl SectorRange {

    #[inline]
    fn from_raw(raw: u32) -> Self {
        Self { offset: raw >> 8, count: raw & 0xFF }
    }

    #[inline]
    fn to_raw(self) -> u32 {
        self.offset << 8 | self.count & 0xFF
    }

    #[inline]
    fn end(self) -> u32 {
        self.offset + self.count
    }

    fn is_empty(self) -> bool {
        self.count == 0
    }

}


#[cfg(test)]
mod tests {

    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("blockwire-regionfile-{}-{name}.mcr", std::process::id()));
        let _ = std::fs::remove_file(&path);
        path
    }

    #[test]
    fn missing_file() {
        let path = temp_path("missing");
        let err = RegionFile::open(&path, false).err().unwrap();
        assert!(matches!(err, RegionError::Io(e) if e.kind() == io::ErrorKind::NotFound));
    }

    #[test]
    fn write_grow_and_reopen() {

        let path = temp_path("grow");
        let mut region = RegionFile::open(&path, true).unwrap();
        assert!(!region.contains_chunk(3, 4));

        let small = vec![7u8; 100];
        let mut writer = region.write_chunk(3, 4);
        writer.write_all(&small).unwrap();
        writer.flush_chunk().unwrap();

        // Incompressible-ish data that needs more than one sector.
        let large = (0..20000u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect::<Vec<_>>();
        let mut writer = region.write_chunk(-1, 0);
        writer.write_all(&large).unwrap();
        writer.flush_chunk().unwrap();

        // Rewrite the first slot with a larger payload, it must move.
        let mut writer = region.write_chunk(3, 4);
        writer.write_all(&large).unwrap();
        writer.flush_chunk().unwrap();

        drop(region);
        assert_eq!(std::fs::metadata(&path).unwrap().len() % SECTOR_SIZE, 0);

        let mut region = RegionFile::open(&path, false).unwrap();
        assert!(region.contains_chunk(3, 4));
        assert!(region.contains_chunk(31, 0));
        assert!(!region.contains_chunk(0, 0));

        let mut data = Vec::new();
        region.read_chunk(3, 4).unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, large);

        let mut data = Vec::new();
        region.read_chunk(31, 0).unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, large);

        assert!(matches!(region.read_chunk(0, 0), Err(RegionError::EmptyChunk)));

        let _ = std::fs::remove_file(&path);

    }

    #[test]
    fn sector_first_fit() {

        let mut map = SectorMap::new(2);
        let a = map.allocate(3);
        let b = map.allocate(1);
        assert_eq!((a.offset, b.offset), (2, 5));

        // A released run is reused when large enough, smaller holes are skipped.
        map.mark(a, false);
        assert_eq!(map.allocate(2).offset, 2);
        assert_eq!(map.allocate(2).offset, 6);
        assert!(map.is_allocated(0) && map.is_allocated(1));
        assert!(!map.is_allocated(4));

    }

    #[test]
    fn too_small() {
        let path = temp_path("small");
        std::fs::write(&path, [0u8; 100]).unwrap();
        assert!(matches!(RegionFile::open(&path, false), Err(RegionError::FileTooSmall(100))));
        let _ = std::fs::remove_file(&path);
    }

}
