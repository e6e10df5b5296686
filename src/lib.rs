// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![cfg_attr(not(test), no_std)]

pub mod low_level;

use core::mem::size_of;

use crate::low_level::{
    FlashStore, Record, Resolution, SectorHeader, SectorId, SectorSpan, SectorStatus,
    FLASH_ERASED,
};

/// Byte-addressable EEPROM emulation over two NOR flash sectors.
///
/// All durable state lives on the media; this handle holds only the sector
/// geometry, the owned flash device, and the identity of the live sector.
/// After a restart, `init` reconstructs everything from the on-media status
/// words alone.
pub struct Eeprom<F> {
    flash: F,
    sectors: [SectorSpan; 2],
    active: Option<SectorId>,
}

impl<F: FlashStore> Eeprom<F> {
    /// Creates an emulator over `flash` with the given sector geometry. No
    /// flash access happens here; call `init` before anything else.
    pub fn new(flash: F, sector1: SectorSpan, sector2: SectorSpan) -> Self {
        Eeprom {
            flash,
            sectors: [sector1, sector2],
            active: None,
        }
    }

    /// Brings the store up after a restart. On return a sector is live:
    /// either one resolved from the media (finishing an interrupted swap if
    /// necessary), or -- on blank or unusable media -- a freshly cleared
    /// first sector. Safe to call repeatedly.
    pub fn init(&mut self) {
        self.update_active();

        if self.active.is_none() {
            self.clear();
        }
    }

    /// Re-derives the live sector from the two on-media status words.
    fn update_active(&mut self) {
        let status1 = low_level::read_sector_status(&self.flash, self.sectors[0]);
        let status2 = low_level::read_sector_status(&self.flash, self.sectors[1]);

        self.active = match low_level::resolve_sectors(status1, status2) {
            Resolution::Active(sector) => Some(sector),
            Resolution::Promote(sector) => {
                // The copy onto this sector finished (its source is already
                // retired) but the promotion never landed. Finish it now.
                let span = self.span(sector);
                match low_level::program_sector_status(
                    &mut self.flash,
                    span,
                    SectorStatus::Active,
                ) {
                    Ok(()) => Some(sector),
                    Err(_) => None,
                }
            }
            Resolution::NoneValid => None,
        };
    }

    /// Destroys all stored data: erases both sectors and activates the
    /// first.
    pub fn clear(&mut self) {
        let _ = self.flash.erase_sector(self.sectors[0].base);
        let _ = self.flash.erase_sector(self.sectors[1].base);
        let _ = low_level::program_sector_status(
            &mut self.flash,
            self.sectors[0],
            SectorStatus::Active,
        );

        self.update_active();
    }

    /// Reads the newest value of a single address. Addresses never written
    /// read as `0xFF`.
    pub fn get_byte(&self, id: u16) -> u8 {
        let mut byte = [FLASH_ERASED];
        self.get(id, &mut byte);
        byte[0]
    }

    /// Reads the newest values of `[id, id + dest.len())` into `dest`, with
    /// `0xFF` for addresses never written.
    pub fn get(&self, id: u16, dest: &mut [u8]) {
        match self.active {
            Some(active) => {
                low_level::read_range(&self.flash, self.span(active), id, dest)
            }
            None => {
                for byte in dest.iter_mut() {
                    *byte = FLASH_ERASED;
                }
            }
        }
    }

    /// Writes a single byte. Atomic with respect to restarts.
    pub fn put_byte(&mut self, id: u16, value: u8) {
        self.put(id, &[value]);
    }

    /// Writes `data` at `[id, id + data.len())`. The whole range becomes
    /// visible atomically: after a restart at any point, reads see either
    /// every new value or every old one.
    ///
    /// A write that would run past the end of the store is dropped. A full
    /// sector, a torn earlier write, or a marginal program reroutes the
    /// write through a sector swap; if even the swap cannot complete, the
    /// write is abandoned and the old values remain.
    pub fn put(&mut self, id: u16, data: &[u8]) {
        if usize::from(id) + data.len() >= self.capacity() {
            return;
        }
        let active = match self.active {
            Some(sector) => sector,
            None => return,
        };

        let source = self.span(active);
        if low_level::write_range(&mut self.flash, source, id, data).is_ok() {
            return;
        }

        let dest = self.span(active.other());
        if low_level::swap_sectors(&mut self.flash, source, dest, id, data).is_ok() {
            self.update_active();
        }
    }

    /// Number of distinct addresses the store can hold.
    pub fn capacity(&self) -> usize {
        let smallest = u32::min(self.sectors[0].size, self.sectors[1].size) as usize;
        (smallest - size_of::<SectorHeader>()) / size_of::<Record>()
    }

    /// The alternate sector, iff it still needs an erase before it can serve
    /// as the next swap destination.
    fn pending_erase(&self) -> Option<SectorId> {
        let alternate = self.active?.other();
        let status = low_level::read_sector_status(&self.flash, self.span(alternate));
        if status == SectorStatus::Erased as u16 {
            None
        } else {
            Some(alternate)
        }
    }

    /// Whether a sector erase is owed. Erasing stalls the flash bus for
    /// hundreds of milliseconds, so the host gets to pick the moment via
    /// `perform_pending_erase`; if it never does, the next swap erases
    /// lazily.
    pub fn has_pending_erase(&self) -> bool {
        self.pending_erase().is_some()
    }

    /// Erases the alternate sector now, if it needs it.
    pub fn perform_pending_erase(&mut self) {
        if let Some(sector) = self.pending_erase() {
            let _ = self.flash.erase_sector(self.span(sector).base);
        }
    }

    /// The sector currently serving reads and writes.
    pub fn active_sector(&self) -> Option<SectorId> {
        self.active
    }

    /// The sector that will be the destination of the next swap.
    pub fn alternate_sector(&self) -> Option<SectorId> {
        self.active.map(SectorId::other)
    }

    pub fn store(&self) -> &F {
        &self.flash
    }

    pub fn store_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    /// Consumes the emulator and hands the flash device back.
    pub fn into_store(self) -> F {
        self.flash
    }

    fn span(&self, sector: SectorId) -> SectorSpan {
        self.sectors[usize::from(sector)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::low_level::tests::{RamFlash, SECTOR1, SECTOR2};
    use crate::low_level::{self, RecordStatus};

    fn fresh() -> Eeprom<RamFlash> {
        let flash = RamFlash::new(&[SECTOR1, SECTOR2]);
        let mut eeprom = Eeprom::new(flash, SECTOR1, SECTOR2);
        eeprom.init();
        eeprom
    }

    /// Simulates a power cycle: tears down the handle and mounts a fresh one
    /// over the same media.
    fn reboot(eeprom: Eeprom<RamFlash>) -> Eeprom<RamFlash> {
        let mut flash = eeprom.into_store();
        flash.fail_never();
        let mut eeprom = Eeprom::new(flash, SECTOR1, SECTOR2);
        eeprom.init();
        eeprom
    }

    #[test]
    fn init_on_junk_activates_first_sector() {
        let eeprom = fresh();

        assert_eq!(
            low_level::read_sector_status(eeprom.store(), SECTOR1),
            SectorStatus::Active as u16,
        );
        assert_eq!(
            low_level::read_sector_status(eeprom.store(), SECTOR2),
            SectorStatus::Erased as u16,
        );
        assert_eq!(eeprom.active_sector(), Some(SectorId::One));
    }

    #[test]
    fn init_is_idempotent() {
        let mut eeprom = fresh();
        eeprom.put(3, &[7, 8, 9]);

        let before = eeprom.store().contents().to_vec();
        eeprom.init();
        assert_eq!(eeprom.store().contents(), &before[..]);
    }

    #[test]
    fn fresh_init_single_put_media_layout() {
        let mut eeprom = fresh();
        eeprom.put_byte(10, 0xCC);

        let flash = eeprom.store();
        assert_eq!(low_level::read_sector_status(flash, SECTOR1), 0x00FF);
        assert_eq!(low_level::read_sector_status(flash, SECTOR2), 0xFFFF);

        // First record sits immediately after the status word.
        let record = low_level::read_record(flash, SECTOR1.base + 2);
        assert_eq!(record.id.get(), 10);
        assert_eq!(record.status, RecordStatus::Valid as u8);
        assert_eq!(record.data, 0xCC);
    }

    #[test]
    fn get_defaults_to_erased() {
        let mut eeprom = fresh();

        assert_eq!(eeprom.get_byte(10), 0xFF);

        // Unrelated records leave other addresses untouched.
        eeprom.put_byte(0, 0xAA);
        assert_eq!(eeprom.get_byte(10), 0xFF);

        let mut out = [0; 3];
        eeprom.get(500, &mut out);
        assert_eq!(out, [0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn read_after_write() {
        let mut eeprom = fresh();

        eeprom.put_byte(0, 0xCC);
        assert_eq!(eeprom.get_byte(0), 0xCC);

        eeprom.put_byte(0, 0xEE);
        assert_eq!(eeprom.get_byte(0), 0xEE);
    }

    #[test]
    fn multi_byte_put_costs_six_programs() {
        let mut eeprom = fresh();
        eeprom.put_byte(10, 0xCC);

        let before = eeprom.store().programs();
        eeprom.put(0, &[1, 2, 3]);
        // Three invalid appends plus three status commits, nothing else.
        assert_eq!(eeprom.store().programs() - before, 6);

        let mut out = [0; 3];
        eeprom.get(0, &mut out);
        assert_eq!(out, [1, 2, 3]);
        assert_eq!(eeprom.get_byte(10), 0xCC);
    }

    #[test]
    fn put_same_value_writes_nothing() {
        let mut eeprom = fresh();
        eeprom.put_byte(5, 0xAB);

        let before = eeprom.store().programs();
        eeprom.put_byte(5, 0xAB);
        assert_eq!(eeprom.store().programs(), before);
    }

    #[test]
    fn put_out_of_range_is_dropped() {
        let mut eeprom = fresh();
        assert_eq!(eeprom.capacity(), 1023);

        let before = eeprom.store().programs();
        // Ends exactly at the capacity boundary; still rejected.
        eeprom.put(1020, &[1, 2, 3]);
        eeprom.put_byte(5000, 1);
        assert_eq!(eeprom.store().programs(), before);

        // One address lower fits.
        eeprom.put(1019, &[1, 2, 3]);
        assert_eq!(eeprom.get_byte(1019), 1);
    }

    #[test]
    fn torn_write_during_append_reads_as_unwritten() {
        let mut eeprom = fresh();

        // Power fails after the first invalid record is programmed.
        eeprom.store_mut().fail_after(1);
        eeprom.put(0, &[1, 2, 3]);

        let mut eeprom = reboot(eeprom);
        let mut out = [0; 3];
        eeprom.get(0, &mut out);
        assert_eq!(out, [0xFF, 0xFF, 0xFF]);

        // The next write routes through a swap and completes normally.
        eeprom.put(0, &[1, 2, 3]);
        eeprom.get(0, &mut out);
        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn torn_write_during_commit_reads_as_unwritten() {
        let mut eeprom = fresh();

        // Three appends and the first status commit land; the rest vanish.
        eeprom.store_mut().fail_after(4);
        eeprom.put(0, &[1, 2, 3]);

        let eeprom = reboot(eeprom);

        // The newest record committed, the two before it did not...
        let flash = eeprom.store();
        assert_eq!(flash.byte_at(SECTOR1.base + 2 + 2), RecordStatus::Invalid as u8);
        assert_eq!(flash.byte_at(SECTOR1.base + 6 + 2), RecordStatus::Invalid as u8);
        assert_eq!(flash.byte_at(SECTOR1.base + 10 + 2), RecordStatus::Valid as u8);

        // ...so the whole range still reads as never written.
        let mut out = [0; 3];
        eeprom.get(0, &mut out);
        assert_eq!(out, [0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn torn_write_leaves_earlier_values_intact() {
        let mut eeprom = fresh();
        eeprom.put(10, &[10, 20, 30]);

        eeprom.store_mut().fail_after(1);
        eeprom.put(11, &[2, 3]);

        let eeprom = reboot(eeprom);
        let mut out = [0; 3];
        eeprom.get(10, &mut out);
        assert_eq!(out, [10, 20, 30]);
    }

    #[test]
    fn full_sector_triggers_swap() {
        let mut eeprom = fresh();

        // Burn every slot of the first sector with alternating values at one
        // address; each put appends exactly one record.
        let slots = (SECTOR1.size as usize - 2) / 4;
        for i in 0..slots {
            eeprom.put_byte(0, if i % 2 == 0 { 0xAA } else { 0x55 });
        }
        assert_eq!(eeprom.active_sector(), Some(SectorId::One));

        // The sector is full; the next write swaps to the second sector.
        eeprom.put_byte(0, 0xAB);
        assert_eq!(eeprom.active_sector(), Some(SectorId::Two));
        assert_eq!(eeprom.get_byte(0), 0xAB);
    }

    #[test]
    fn swap_preserves_every_live_value() {
        let mut eeprom = fresh();
        eeprom.put_byte(1, 0x11);
        eeprom.put(2, &[0x22, 0x23]);
        eeprom.put_byte(9, 0x99);
        // An address deliberately reset to the erased value; the swap elides
        // its record and reads still produce 0xFF.
        eeprom.put_byte(4, 0x44);
        eeprom.put_byte(4, 0xFF);

        // A torn record forces the next put through the swap path.
        let span = SECTOR1;
        low_level::append_record(
            eeprom.store_mut(),
            span,
            7,
            RecordStatus::Invalid,
            0x77,
        )
        .unwrap();

        eeprom.put_byte(5, 0x55);
        assert_eq!(eeprom.active_sector(), Some(SectorId::Two));

        assert_eq!(eeprom.get_byte(1), 0x11);
        assert_eq!(eeprom.get_byte(2), 0x22);
        assert_eq!(eeprom.get_byte(3), 0x23);
        assert_eq!(eeprom.get_byte(4), 0xFF);
        assert_eq!(eeprom.get_byte(5), 0x55);
        assert_eq!(eeprom.get_byte(7), 0xFF);
        assert_eq!(eeprom.get_byte(9), 0x99);
    }

    #[test]
    fn swap_leaves_source_pending_erase() {
        let mut eeprom = fresh();
        eeprom.put_byte(1, 0x11);
        low_level::append_record(
            eeprom.store_mut(),
            SECTOR1,
            7,
            RecordStatus::Invalid,
            0x77,
        )
        .unwrap();
        eeprom.put_byte(5, 0x55);

        assert_eq!(
            low_level::read_sector_status(eeprom.store(), SECTOR1),
            SectorStatus::Inactive as u16,
        );
        assert!(eeprom.has_pending_erase());

        eeprom.perform_pending_erase();
        assert!(!eeprom.has_pending_erase());
        assert_eq!(
            low_level::read_sector_status(eeprom.store(), SECTOR1),
            SectorStatus::Erased as u16,
        );
        assert_eq!(eeprom.get_byte(1), 0x11);
    }

    #[test]
    fn both_sectors_active_resolves_to_first() {
        let mut eeprom = fresh();
        eeprom.put_byte(10, 0xCC);

        // A restart between promoting the destination and retiring the
        // source can leave both sectors marked live.
        eeprom
            .store_mut()
            .write_status_raw(SECTOR2, SectorStatus::Active as u16);

        let eeprom = reboot(eeprom);
        assert_eq!(eeprom.active_sector(), Some(SectorId::One));
        assert_eq!(eeprom.get_byte(10), 0xCC);
    }

    #[test]
    fn completed_copy_is_promoted_on_init() {
        let mut eeprom = fresh();

        // Forge the state just after a finished copy onto sector 2: source
        // retired, destination never promoted.
        let flash = eeprom.store_mut();
        flash.erase_all();
        flash.write_status_raw(SECTOR2, SectorStatus::Copy as u16);
        low_level::append_record(flash, SECTOR2, 3, RecordStatus::Valid, 0x33).unwrap();
        flash.write_status_raw(SECTOR1, SectorStatus::Inactive as u16);

        let eeprom = reboot(eeprom);
        assert_eq!(eeprom.active_sector(), Some(SectorId::Two));
        assert_eq!(
            low_level::read_sector_status(eeprom.store(), SECTOR2),
            SectorStatus::Active as u16,
        );
        assert_eq!(eeprom.get_byte(3), 0x33);
        assert!(eeprom.has_pending_erase());
    }

    #[test]
    fn crash_during_swap_copy_keeps_source_authoritative() {
        let mut eeprom = fresh();
        eeprom.put_byte(1, 0x11);
        low_level::append_record(
            eeprom.store_mut(),
            SECTOR1,
            7,
            RecordStatus::Invalid,
            0x77,
        )
        .unwrap();

        // The swap gets as far as marking the destination as the copy
        // target, then power fails.
        eeprom.store_mut().fail_after(1);
        eeprom.put_byte(5, 0x55);

        let mut eeprom = reboot(eeprom);
        assert_eq!(eeprom.active_sector(), Some(SectorId::One));
        assert_eq!(eeprom.get_byte(1), 0x11);
        assert_eq!(eeprom.get_byte(5), 0xFF);
        // The half-copied alternate counts as needing an erase.
        assert!(eeprom.has_pending_erase());

        // Retrying the write completes the interrupted work.
        eeprom.put_byte(5, 0x55);
        assert_eq!(eeprom.active_sector(), Some(SectorId::Two));
        assert_eq!(eeprom.get_byte(1), 0x11);
        assert_eq!(eeprom.get_byte(5), 0x55);
    }

    #[test]
    fn clear_wipes_everything() {
        let mut eeprom = fresh();
        eeprom.put(0, &[1, 2, 3]);

        eeprom.clear();

        assert_eq!(
            low_level::read_sector_status(eeprom.store(), SECTOR1),
            SectorStatus::Active as u16,
        );
        assert_eq!(
            low_level::read_sector_status(eeprom.store(), SECTOR2),
            SectorStatus::Erased as u16,
        );
        let mut out = [0; 3];
        eeprom.get(0, &mut out);
        assert_eq!(out, [0xFF, 0xFF, 0xFF]);
        assert!(!eeprom.has_pending_erase());
    }

    #[test]
    fn capacity_follows_smallest_sector() {
        let eeprom = fresh();
        // (0x1000 - 2) / 4
        assert_eq!(eeprom.capacity(), 1023);
    }
}
