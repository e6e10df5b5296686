// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{bail, Context};
use clap::Parser;
use num_traits::FromPrimitive;
use remanence::low_level::{
    self, EraseFailed, FlashStore, MarginalWrite, SectorId, SectorSpan, SectorStatus,
    FLASH_ERASED,
};
use remanence::Eeprom;

#[derive(Parser)]
struct Eetool {
    /// Size of the first sector in bytes.
    #[clap(long, default_value_t = 0x4000)]
    sector1_size: u32,

    /// Size of the second sector in bytes.
    #[clap(long, default_value_t = 0x1000)]
    sector2_size: u32,

    image_file: std::path::PathBuf,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Create a blank (all-0xFF) image file covering both sectors.
    Create,
    /// Print the status word and record count of each sector.
    Status,
    /// Resolve the live sector, reinitialising blank or corrupt media.
    Init,
    /// Erase both sectors and activate the first.
    Clear,
    /// Read `len` bytes starting at `id`.
    Get {
        id: u16,
        #[clap(default_value_t = 1)]
        len: u16,
    },
    /// Write the given byte values starting at `id`.
    Put {
        id: u16,
        #[clap(required = true)]
        values: Vec<u8>,
    },
    /// List every record in both sectors.
    Dump,
    /// Erase the retired alternate sector if one is waiting.
    PerformErase,
}

fn main() -> Result<(), anyhow::Error> {
    let args = Eetool::parse();

    let sector1 = SectorSpan::new(0, args.sector1_size);
    let sector2 = SectorSpan::new(args.sector1_size, args.sector2_size);

    if let Cmd::Create = args.cmd {
        let blank = vec![FLASH_ERASED; (args.sector1_size + args.sector2_size) as usize];
        std::fs::write(&args.image_file, blank).with_context(|| {
            format!("creating image file {}", args.image_file.display())
        })?;
        println!(
            "created blank image of {:#x} + {:#x} bytes",
            args.sector1_size, args.sector2_size,
        );
        return Ok(());
    }

    let image = FileImage::load(&args.image_file, sector1, sector2)?;

    match args.cmd {
        Cmd::Create => unreachable!(),
        Cmd::Status => {
            for id in SectorId::ALL {
                let sector = image.sectors[usize::from(id)];
                let raw = low_level::read_sector_status(&image, sector);
                let decoded = match SectorStatus::from_u16(raw) {
                    Some(s) => format!("{s:?}"),
                    None => "garbage".to_string(),
                };
                let total = low_level::records(&image, sector).count();
                let committed = low_level::valid_records(&image, sector).count();
                println!("{id:?}: status {raw:#06x} ({decoded})");
                println!("- {total} records, {committed} committed and visible");
            }
            return Ok(());
        }
        Cmd::Dump => {
            for id in SectorId::ALL {
                let sector = image.sectors[usize::from(id)];
                println!("records in {id:?}:");
                for (offset, record) in low_level::records(&image, sector) {
                    println!(
                        "  {offset:#08x}: id {:5} status {:#04x} data {:#04x}",
                        record.id.get(),
                        record.status,
                        record.data,
                    );
                }
            }
            return Ok(());
        }
        _ => (),
    }

    let mut eeprom = Eeprom::new(image, sector1, sector2);
    eeprom.init();

    match args.cmd {
        Cmd::Create | Cmd::Status | Cmd::Dump => unreachable!(),
        Cmd::Init => {
            println!("live sector: {:?}", eeprom.active_sector());
            if eeprom.has_pending_erase() {
                println!("alternate sector has a pending erase");
            }
        }
        Cmd::Clear => {
            eeprom.clear();
            println!("cleared");
        }
        Cmd::Get { id, len } => {
            let mut out = vec![0; usize::from(len)];
            eeprom.get(id, &mut out);
            if let [byte] = out[..] {
                println!("{byte:#04x}");
            } else {
                println!("{}", pretty_hex::pretty_hex(&out));
            }
        }
        Cmd::Put { id, values } => {
            eeprom.put(id, &values);
            let mut check = vec![0; values.len()];
            eeprom.get(id, &mut check);
            if check == values {
                println!("ok");
            } else {
                bail!("write did not take; the store may be full");
            }
        }
        Cmd::PerformErase => {
            if eeprom.has_pending_erase() {
                eeprom.perform_pending_erase();
                println!("erased");
            } else {
                println!("nothing to erase");
            }
        }
    }

    eeprom.into_store().save(&args.image_file)?;

    Ok(())
}

/// Flash image held in memory for the duration of a command and written back
/// at the end. Programs follow the NOR rule and verify, so the tool refuses
/// impossible writes the same way real flash would.
struct FileImage {
    data: Vec<u8>,
    sectors: [SectorSpan; 2],
}

impl FileImage {
    fn load(
        path: &std::path::Path,
        sector1: SectorSpan,
        sector2: SectorSpan,
    ) -> Result<Self, anyhow::Error> {
        let data = std::fs::read(path)
            .with_context(|| format!("opening image file {}", path.display()))?;
        let expected = (sector1.size + sector2.size) as usize;
        if data.len() != expected {
            bail!(
                "image is {} bytes but the sector geometry needs {}",
                data.len(),
                expected,
            );
        }
        Ok(FileImage {
            data,
            sectors: [sector1, sector2],
        })
    }

    fn save(&self, path: &std::path::Path) -> Result<(), anyhow::Error> {
        std::fs::write(path, &self.data)
            .with_context(|| format!("writing image file {}", path.display()))
    }
}

impl FlashStore for FileImage {
    fn read(&self, offset: u32, dest: &mut [u8]) {
        let offset = offset as usize;
        dest.copy_from_slice(&self.data[offset..offset + dest.len()]);
    }

    fn program(&mut self, offset: u32, data: &[u8]) -> Result<(), MarginalWrite> {
        let start = offset as usize;
        for (cell, &byte) in self.data[start..start + data.len()].iter_mut().zip(data) {
            *cell &= byte;
        }
        if self.data[start..start + data.len()] != *data {
            return Err(MarginalWrite);
        }
        Ok(())
    }

    fn erase_sector(&mut self, offset: u32) -> Result<(), EraseFailed> {
        let sector = self
            .sectors
            .iter()
            .find(|s| offset >= s.base && offset < s.end())
            .copied()
            .ok_or(EraseFailed)?;
        let start = sector.base as usize;
        let end = sector.end() as usize;
        self.data[start..end].fill(FLASH_ERASED);
        Ok(())
    }
}
