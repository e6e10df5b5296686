// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use core::mem::size_of;
use num_traits::FromPrimitive;
use zerocopy::{AsBytes, FromBytes, Unaligned};

//////////////////////////////////////////////////////////////////////////////
// Convenience wrapper for zerocopy.

fn cast_prefix<T>(bytes: &[u8]) -> (&T, &[u8])
    where T: FromBytes + Unaligned,
{
    let (lv, rest) = zerocopy::LayoutVerified::<_, T>::new_unaligned_from_prefix(bytes)
        .expect("type does not fit in buffer");
    (lv.into_ref(), rest)
}

//////////////////////////////////////////////////////////////////////////////
// At-rest layout.

/// Shorthand for a `u16` in little-endian representation.
type U16LE = zerocopy::U16<byteorder::LittleEndian>;

/// Value of every byte of erased NOR flash.
pub const FLASH_ERASED: u8 = 0xFF;

/// Status word written at the start of each sector.
///
/// This appears at offset 0 of both sectors. The encodings are chosen so that
/// each lifecycle step only clears bits, which means a transition is a single
/// program operation with no intervening erase.
#[derive(Copy, Clone, Debug, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct SectorHeader {
    pub status: U16LE,
}

/// Defined values for the sector status word. Anything else is garbage --
/// uninitialized flash, or the debris of a marginal write -- and is treated
/// as no state at all.
#[derive(Copy, Clone, Debug, Eq, PartialEq, num_derive::FromPrimitive)]
#[repr(u16)]
pub enum SectorStatus {
    /// Sector is blank.
    Erased = 0xFFFF,
    /// Sector is the destination of a copy that has not finished.
    Copy = 0x0FFF,
    /// Sector is the sole live sector.
    Active = 0x00FF,
    /// Sector is an old live sector awaiting erase.
    Inactive = 0x000F,
}

/// A single cell of the byte store: one logical address, one value.
///
/// Records are appended contiguously after the sector header and are never
/// rewritten in place except for the one-byte status commit.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct Record {
    /// Logical byte offset addressed by the caller. `0xFFFF` is reserved for
    /// erased slots.
    pub id: U16LE,
    /// One of the `RecordStatus` encodings.
    pub status: u8,
    /// The stored value.
    pub data: u8,
}

impl Record {
    /// Size of a record on media, in bytes.
    pub const SIZE: u32 = size_of::<Self>() as u32;
    /// Offset of the `status` byte within a record.
    pub const STATUS_OFFSET: u32 = 2;
    /// The `id` read back from an erased slot.
    pub const EMPTY_ID: u16 = 0xFFFF;

    pub fn new(id: u16, status: RecordStatus, data: u8) -> Self {
        Record {
            id: id.into(),
            status: status as u8,
            data,
        }
    }

    /// Decodes the status byte, or `None` for a marginal or garbage pattern.
    pub fn status(&self) -> Option<RecordStatus> {
        RecordStatus::from_u8(self.status)
    }

    pub fn is_empty(&self) -> bool {
        self.status() == Some(RecordStatus::Empty)
    }

    pub fn is_invalid(&self) -> bool {
        self.status() == Some(RecordStatus::Invalid)
    }

    pub fn is_valid(&self) -> bool {
        self.status() == Some(RecordStatus::Valid)
    }
}

/// Defined values for the record status byte.
///
/// Like the sector status word, the sequence `Empty -> Invalid -> Valid` only
/// ever clears bits, so each step is one program of the status byte.
#[derive(Copy, Clone, Debug, Eq, PartialEq, num_derive::FromPrimitive)]
#[repr(u8)]
pub enum RecordStatus {
    /// Slot is erased flash.
    Empty = 0xFF,
    /// Record written but not yet committed; hidden from readers.
    Invalid = 0x0F,
    /// Record committed; its `data` is authoritative for its `id`.
    Valid = 0x00,
}

//////////////////////////////////////////////////////////////////////////////
// Sector geometry.

/// Designates one of the two sectors backing the store. This is like a ranged
/// integer, or a bool with application-specific names.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SectorId {
    One = 0,
    Two = 1,
}

impl SectorId {
    /// Convenient array of both sectors.
    pub const ALL: [Self; 2] = [Self::One, Self::Two];

    /// Given a sector, get the _other_ one.
    pub fn other(self) -> Self {
        match self {
            Self::One => Self::Two,
            Self::Two => Self::One,
        }
    }
}

impl From<SectorId> for usize {
    fn from(s: SectorId) -> Self {
        match s {
            SectorId::One => 0,
            SectorId::Two => 1,
        }
    }
}

/// Location and extent of one erase sector within the flash address space.
/// The two sectors may have different sizes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SectorSpan {
    pub base: u32,
    pub size: u32,
}

impl SectorSpan {
    pub const fn new(base: u32, size: u32) -> Self {
        SectorSpan { base, size }
    }

    /// Offset of the first record slot, just past the sector header.
    pub fn data_start(&self) -> u32 {
        self.base + size_of::<SectorHeader>() as u32
    }

    /// Offset one past the last byte of the sector.
    pub fn end(&self) -> u32 {
        self.base + self.size
    }
}

//////////////////////////////////////////////////////////////////////////////
// Flash device interface.

/// A program operation failed outright or did not verify. The true state of
/// the touched cells is indeterminate: they may read back as either value.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MarginalWrite;

/// A sector erase failed or was interrupted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EraseFailed;

/// Capability object describing the flash device underneath the store.
///
/// Offsets address a single linear byte space covering both sectors. The
/// device is owned exclusively by the emulator; nothing else may program or
/// erase these sectors behind its back.
pub trait FlashStore {
    /// Copies `dest.len()` bytes starting at `offset` into `dest`. Reads of
    /// in-range offsets always succeed.
    fn read(&self, offset: u32, dest: &mut [u8]);

    /// Programs `data` at `offset` under the NOR constraint: each result byte
    /// is the AND of the current byte and the source byte. Implementations
    /// must verify the result and report a mismatch as `MarginalWrite`.
    fn program(&mut self, offset: u32, data: &[u8]) -> Result<(), MarginalWrite>;

    /// Erases the sector containing `offset`, restoring every byte in it to
    /// `0xFF`. Slow: hundreds of milliseconds on real parts, during which the
    /// bus stalls.
    fn erase_sector(&mut self, offset: u32) -> Result<(), EraseFailed>;
}

//////////////////////////////////////////////////////////////////////////////
// Sector state machine.

/// Reads the raw status word of `sector`. Raw because the caller usually
/// wants to distinguish garbage from the defined encodings itself.
pub fn read_sector_status<F: FlashStore>(flash: &F, sector: SectorSpan) -> u16 {
    let mut buf = [0; size_of::<SectorHeader>()];
    flash.read(sector.base, &mut buf);
    let (header, _) = cast_prefix::<SectorHeader>(&buf);
    header.status.get()
}

/// Programs a new status word on `sector`. Legal transitions only clear bits,
/// so this never needs an erase first.
pub fn program_sector_status<F: FlashStore>(
    flash: &mut F,
    sector: SectorSpan,
    status: SectorStatus,
) -> Result<(), MarginalWrite> {
    let header = SectorHeader { status: (status as u16).into() };
    flash.program(sector.base, header.as_bytes())
}

/// Outcome of examining the two sector status words after a restart.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Resolution {
    /// This sector is live; the other is the alternate.
    Active(SectorId),
    /// A copy onto this sector completed (the source is already retired) but
    /// power was lost before it was marked live. Program it `Active` and use
    /// it; the promotion is idempotent.
    Promote(SectorId),
    /// No usable sector. The media must be reinitialised.
    NoneValid,
}

/// Deterministic mapping from the pair of raw status words to the live
/// sector, using only on-media bits.
///
/// If both sectors read `Active` -- possible when a restart hit the window
/// between marking the copy destination live and retiring the source -- the
/// first sector wins the tie. Its contents are served until the next swap
/// redoes the work.
pub fn resolve_sectors(status1: u16, status2: u16) -> Resolution {
    let s1 = SectorStatus::from_u16(status1);
    let s2 = SectorStatus::from_u16(status2);

    match (s1, s2) {
        (Some(SectorStatus::Active), _) => Resolution::Active(SectorId::One),
        (_, Some(SectorStatus::Active)) => Resolution::Active(SectorId::Two),

        (Some(SectorStatus::Copy), Some(SectorStatus::Inactive)) => {
            Resolution::Promote(SectorId::One)
        }
        (Some(SectorStatus::Inactive), Some(SectorStatus::Copy)) => {
            Resolution::Promote(SectorId::Two)
        }

        _ => Resolution::NoneValid,
    }
}

//////////////////////////////////////////////////////////////////////////////
// Record log: reading and iteration.

/// Reads the four record bytes at `offset`. No validation; the caller
/// inspects the status.
pub fn read_record<F: FlashStore>(flash: &F, offset: u32) -> Record {
    let mut buf = [0; size_of::<Record>()];
    flash.read(offset, &mut buf);
    let (record, _) = cast_prefix::<Record>(&buf);
    *record
}

/// Finds the append point: the offset of the first slot whose status reads
/// `Empty`, scanning forward from the start of the log. Returns an offset
/// with less than one record of room left when the sector is full.
pub fn find_empty_offset<F: FlashStore>(flash: &F, sector: SectorSpan) -> u32 {
    let mut offset = sector.data_start();
    while offset + Record::SIZE <= sector.end() {
        if read_record(flash, offset).is_empty() {
            break;
        }
        offset += Record::SIZE;
    }
    offset
}

/// Forward iterator over the programmed records of a sector, in append
/// order. Stops at the first `Empty` slot or the end of the sector.
pub struct Records<'f, F> {
    flash: &'f F,
    offset: u32,
    end: u32,
}

pub fn records<F: FlashStore>(flash: &F, sector: SectorSpan) -> Records<'_, F> {
    Records {
        flash,
        offset: sector.data_start(),
        end: sector.end(),
    }
}

impl<F: FlashStore> Iterator for Records<'_, F> {
    type Item = (u32, Record);

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset + Record::SIZE > self.end {
            return None;
        }
        let record = read_record(self.flash, self.offset);
        if record.is_empty() {
            return None;
        }
        let item = (self.offset, record);
        self.offset += Record::SIZE;
        Some(item)
    }
}

/// Iterator over the committed prefix of the log: yields `Valid` records in
/// append order, stopping at the first record that is anything else.
///
/// Records past the first uncommitted one are the tail of a torn write. They
/// stay hidden until a swap discards them.
pub struct ValidRecords<'f, F> {
    inner: Records<'f, F>,
    torn: bool,
}

pub fn valid_records<F: FlashStore>(flash: &F, sector: SectorSpan) -> ValidRecords<'_, F> {
    ValidRecords {
        inner: records(flash, sector),
        torn: false,
    }
}

impl<F: FlashStore> Iterator for ValidRecords<'_, F> {
    type Item = (u32, Record);

    fn next(&mut self) -> Option<Self::Item> {
        if self.torn {
            return None;
        }
        let (offset, record) = self.inner.next()?;
        if record.is_valid() {
            Some((offset, record))
        } else {
            self.torn = true;
            None
        }
    }
}

/// Offset of the last `Invalid` record in the log, if any. Found by forward
/// scan; the uncommitted records of an interrupted write are always the
/// trailing run of the log.
pub fn find_last_invalid_offset<F: FlashStore>(
    flash: &F,
    sector: SectorSpan,
) -> Option<u32> {
    let mut last = None;
    for (offset, record) in records(flash, sector) {
        if record.is_invalid() {
            last = Some(offset);
        }
    }
    last
}

pub fn has_invalid_records<F: FlashStore>(flash: &F, sector: SectorSpan) -> bool {
    find_last_invalid_offset(flash, sector).is_some()
}

/// Iterator over the trailing run of `Invalid` records, newest first: starts
/// at the last invalid record and steps backwards until the first record
/// that is not invalid.
pub struct InvalidRecordsRev<'f, F> {
    flash: &'f F,
    next: Option<u32>,
    start: u32,
}

pub fn invalid_records_rev<F: FlashStore>(
    flash: &F,
    sector: SectorSpan,
) -> InvalidRecordsRev<'_, F> {
    InvalidRecordsRev {
        next: find_last_invalid_offset(flash, sector),
        start: sector.data_start(),
        flash,
    }
}

impl<F: FlashStore> Iterator for InvalidRecordsRev<'_, F> {
    type Item = (u32, Record);

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.next?;
        let record = read_record(self.flash, offset);
        if !record.is_invalid() {
            self.next = None;
            return None;
        }
        self.next = if offset >= self.start + Record::SIZE {
            Some(offset - Record::SIZE)
        } else {
            None
        };
        Some((offset, record))
    }
}

/// One step of the sorted enumeration: the smallest id greater than
/// `prev_id` among the committed records, with its newest value.
///
/// Each call is a full sweep of the committed prefix, making a complete
/// enumeration quadratic. That is acceptable: it runs only during a sector
/// swap, and it needs no RAM proportional to the log.
fn next_valid_after<F: FlashStore>(
    flash: &F,
    sector: SectorSpan,
    prev_id: Option<u16>,
) -> Option<(u16, u8)> {
    let mut found: Option<(u16, u8)> = None;
    for (_, record) in valid_records(flash, sector) {
        let id = record.id.get();
        if let Some(prev) = prev_id {
            if id <= prev {
                continue;
            }
        }
        match found {
            // Append order means later is newer: a later record with the
            // same id as the candidate supersedes it.
            Some((current, _)) if id > current => (),
            _ => found = Some((id, record.data)),
        }
    }
    found
}

/// Iterator over the committed records in ascending id order, one entry per
/// id, newest value winning.
pub struct SortedValidRecords<'f, F> {
    flash: &'f F,
    sector: SectorSpan,
    prev_id: Option<u16>,
}

pub fn sorted_valid_records<F: FlashStore>(
    flash: &F,
    sector: SectorSpan,
) -> SortedValidRecords<'_, F> {
    SortedValidRecords {
        flash,
        sector,
        prev_id: None,
    }
}

impl<F: FlashStore> Iterator for SortedValidRecords<'_, F> {
    type Item = (u16, u8);

    fn next(&mut self) -> Option<Self::Item> {
        let found = next_valid_after(self.flash, self.sector, self.prev_id);
        if let Some((id, _)) = found {
            self.prev_id = Some(id);
        }
        found
    }
}

//////////////////////////////////////////////////////////////////////////////
// Record log: writing.

/// Things that can go wrong appending a record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AppendError {
    /// No erased slot left in this sector.
    NoRoom,
    /// The program failed or did not verify.
    Marginal,
}

impl From<MarginalWrite> for AppendError {
    fn from(_: MarginalWrite) -> Self {
        Self::Marginal
    }
}

/// Writes a record into the first empty slot of `sector`, returning the
/// offset it landed at.
pub fn append_record<F: FlashStore>(
    flash: &mut F,
    sector: SectorSpan,
    id: u16,
    status: RecordStatus,
    data: u8,
) -> Result<u32, AppendError> {
    let offset = find_empty_offset(flash, sector);
    if sector.end() - offset < Record::SIZE {
        return Err(AppendError::NoRoom);
    }
    let record = Record::new(id, status, data);
    flash.program(offset, record.as_bytes())?;
    Ok(offset)
}

/// Programs a new status onto the record at `offset`. This is the one-byte
/// operation the atomicity of a range write reduces to.
pub fn commit_record<F: FlashStore>(
    flash: &mut F,
    offset: u32,
    status: RecordStatus,
) -> Result<(), MarginalWrite> {
    flash.program(offset + Record::STATUS_OFFSET, &[status as u8])
}

//////////////////////////////////////////////////////////////////////////////
// Range read / range write.

/// Materialises the bytes `[start_id, start_id + dest.len())` from the
/// committed records of `sector`. Addresses never written read as `0xFF`.
/// Duplicate ids overwrite in append order, so the newest value wins.
pub fn read_range<F: FlashStore>(
    flash: &F,
    sector: SectorSpan,
    start_id: u16,
    dest: &mut [u8],
) {
    for byte in dest.iter_mut() {
        *byte = FLASH_ERASED;
    }

    let start = u32::from(start_id);
    let end = start + dest.len() as u32;
    for (_, record) in valid_records(flash, sector) {
        let id = u32::from(record.id.get());
        if id >= start && id < end {
            dest[(id - start) as usize] = record.data;
        }
    }
}

/// Reads the current value of a single address.
pub fn read_byte<F: FlashStore>(flash: &F, sector: SectorSpan, id: u16) -> u8 {
    let mut byte = [FLASH_ERASED];
    read_range(flash, sector, id, &mut byte);
    byte[0]
}

/// Things that can interrupt a range write. None of these escape the store;
/// they all route the write through a sector swap.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RangeWriteError {
    /// An earlier write tore; its uncommitted records still sit in the log
    /// and must be discarded by a swap before anything new is written.
    PriorTornWrite,
    /// The sector filled up mid-write.
    NoRoom,
    /// A program failed or did not verify.
    Marginal,
}

impl From<AppendError> for RangeWriteError {
    fn from(e: AppendError) -> Self {
        match e {
            AppendError::NoRoom => Self::NoRoom,
            AppendError::Marginal => Self::Marginal,
        }
    }
}

impl From<MarginalWrite> for RangeWriteError {
    fn from(_: MarginalWrite) -> Self {
        Self::Marginal
    }
}

/// Writes `data` at `[start_id, start_id + data.len())` so that the whole
/// range becomes visible atomically with respect to restarts.
///
/// Phase A appends every changed byte as an `Invalid` record, in ascending
/// address order. Phase B then commits the statuses to `Valid` in reverse
/// order, newest record first. A restart anywhere in between leaves at
/// least one `Invalid` record *before* every committed one, so the
/// committed suffix stays hidden from readers until the next swap
/// republishes it.
pub fn write_range<F: FlashStore>(
    flash: &mut F,
    sector: SectorSpan,
    start_id: u16,
    data: &[u8],
) -> Result<(), RangeWriteError> {
    if has_invalid_records(flash, sector) {
        return Err(RangeWriteError::PriorTornWrite);
    }

    // Phase A. Unchanged bytes are skipped entirely; rewriting them would
    // burn slots for nothing.
    for (i, &byte) in data.iter().enumerate() {
        let id = start_id + i as u16;
        if read_byte(flash, sector, id) != byte {
            append_record(flash, sector, id, RecordStatus::Invalid, byte)?;
        }
    }

    // Phase B. The scan is interleaved with the commits: after committing
    // the record at `offset`, everything before it is still invalid, so
    // stepping backwards one slot at a time visits exactly the run phase A
    // appended.
    let mut offset = match find_last_invalid_offset(flash, sector) {
        Some(offset) => offset,
        // Nothing changed, nothing to commit.
        None => return Ok(()),
    };
    loop {
        let record = read_record(flash, offset);
        if !record.is_invalid() {
            break;
        }
        commit_record(flash, offset, RecordStatus::Valid)?;
        if offset < sector.data_start() + Record::SIZE {
            break;
        }
        offset -= Record::SIZE;
    }

    Ok(())
}

//////////////////////////////////////////////////////////////////////////////
// Sector swap.

/// Checks that every byte of `sector` reads back erased. A sector that fails
/// this was interrupted mid-erase and must be erased again before use.
pub fn verify_erased<F: FlashStore>(flash: &F, sector: SectorSpan) -> bool {
    let mut buf = [0; 32];
    let mut offset = sector.base;
    while offset < sector.end() {
        let n = usize::min(buf.len(), (sector.end() - offset) as usize);
        flash.read(offset, &mut buf[..n]);
        if buf[..n].iter().any(|&b| b != FLASH_ERASED) {
            return false;
        }
        offset += n as u32;
    }
    true
}

/// Things that can make a sector swap fail. After two attempts the swap is
/// abandoned and the triggering write is reported unable to complete.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SwapError {
    /// Erasing the destination failed.
    Erase,
    /// The destination filled before all live values fit.
    NoRoom,
    /// A program failed or did not verify.
    Marginal,
}

impl From<EraseFailed> for SwapError {
    fn from(_: EraseFailed) -> Self {
        Self::Erase
    }
}

impl From<MarginalWrite> for SwapError {
    fn from(_: MarginalWrite) -> Self {
        Self::Marginal
    }
}

impl From<AppendError> for SwapError {
    fn from(e: AppendError) -> Self {
        match e {
            AppendError::NoRoom => Self::NoRoom,
            AppendError::Marginal => Self::Marginal,
        }
    }
}

/// Moves the newest value of every live address from `source` to `dest`,
/// layering the pending write `(start_id, data)` on top, then promotes
/// `dest` to `Active` and retires `source` to `Inactive`.
///
/// Runs at most two attempts. The second attempt exists for marginally
/// erased cells: flash that reads `0xFF` after an interrupted erase can
/// still refuse to program, and only a fresh erase fixes it -- so the retry
/// always erases rather than trusting the verify scan.
///
/// Readers keep resolving to `source` until the `Active` program lands on
/// `dest`, so a restart anywhere before that point loses nothing. A restart
/// between the two final status programs leaves both sectors `Active`; the
/// resolution tie-break serves the first sector until the next swap redoes
/// the work.
pub fn swap_sectors<F: FlashStore>(
    flash: &mut F,
    source: SectorSpan,
    dest: SectorSpan,
    start_id: u16,
    data: &[u8],
) -> Result<(), SwapError> {
    let mut outcome = Err(SwapError::Marginal);
    for attempt in 0..2 {
        outcome = swap_attempt(flash, source, dest, start_id, data, attempt > 0);
        if outcome.is_ok() {
            break;
        }
    }
    outcome
}

fn swap_attempt<F: FlashStore>(
    flash: &mut F,
    source: SectorSpan,
    dest: SectorSpan,
    start_id: u16,
    data: &[u8],
    force_erase: bool,
) -> Result<(), SwapError> {
    if force_erase || !verify_erased(flash, dest) {
        flash.erase_sector(dest.base)?;
    }

    program_sector_status(flash, dest, SectorStatus::Copy)?;

    // Carry over live values, skipping the window the pending write is about
    // to supply and any value that is 0xFF anyway (readers produce 0xFF for
    // absent addresses, so storing it would waste a slot).
    let start = u32::from(start_id);
    let end = start + data.len() as u32;
    let mut prev_id = None;
    while let Some((id, byte)) = next_valid_after(flash, source, prev_id) {
        prev_id = Some(id);
        let pending = u32::from(id) >= start && u32::from(id) < end;
        if !pending && byte != FLASH_ERASED {
            append_record(flash, dest, id, RecordStatus::Valid, byte)?;
        }
    }

    for (i, &byte) in data.iter().enumerate() {
        if byte != FLASH_ERASED {
            append_record(flash, dest, start_id + i as u16, RecordStatus::Valid, byte)?;
        }
    }

    program_sector_status(flash, dest, SectorStatus::Active)?;
    program_sector_status(flash, source, SectorStatus::Inactive)?;

    Ok(())
}
