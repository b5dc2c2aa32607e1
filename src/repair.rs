//! GPT repair/resizer: reconciles the archive's GPT with the device's
//! when partition geometry differs (§4.F).

use rand::RngCore;

use crate::config;
use crate::disk::LogicalBlockSize;
use crate::error::{Error, Result};
use crate::gpt::{Entry, Gpt};
use crate::logging::*;
use crate::slices;

/// Which finishing mode to apply after the common prelude.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PackMode {
    /// Default: adjust the OP/userdata boundary in place.
    Forward,
    /// Opt-in: reorder contiguous relocatable slices by rank first.
    Reverse,
}

/// Runs the common prelude (persistent-ID carry-over) and then the
/// requested finishing mode, producing a GPT that is safe to write.
pub fn repair(
    archive_gpt: &Gpt,
    device_gpt: &Gpt,
    mode: PackMode,
    sector_size: LogicalBlockSize,
) -> Result<Gpt> {
    let mut repaired = archive_gpt.clone();
    carry_over_persistent_id(&mut repaired, device_gpt);

    let op_size_hint_bytes = config::read_op_resize_hint()?.unwrap_or(0);
    let desired_op_blocks = op_size_hint_bytes / sector_size.as_u64();

    match mode {
        PackMode::Forward => finish_pack_forward(&mut repaired, desired_op_blocks)?,
        PackMode::Reverse => {
            finish_pack_reverse(&mut repaired)?;
            finish_pack_forward(&mut repaired, desired_op_blocks)?;
        }
    }

    Ok(repaired)
}

/// The `persistent` slice's unique ID is intentionally stable across
/// updates: copy it from the device's GPT, or generate 16 random bytes if
/// the device has no such entry (§4.F prelude).
fn carry_over_persistent_id(archive_gpt: &mut Gpt, device_gpt: &Gpt) {
    let Some(archive_entry) = find_entry_mut(archive_gpt, "persistent") else {
        return;
    };
    if let Some(device_entry) = find_entry(device_gpt, "persistent") {
        archive_entry.unique_guid = device_entry.unique_guid;
    } else {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        archive_entry.unique_guid = uuid::Builder::from_bytes(bytes).into_uuid();
    }
}

fn find_entry<'a>(gpt: &'a Gpt, name: &str) -> Option<&'a Entry> {
    gpt.entries.iter().find(|e| e.name == name)
}

fn find_entry_mut<'a>(gpt: &'a mut Gpt, name: &str) -> Option<&'a mut Entry> {
    gpt.entries.iter_mut().find(|e| e.name == name)
}

/// pack-forward: `OP` and `userdata` must be adjacent. Shifts the boundary
/// between them by `desired_op_blocks - current_op_blocks`; zeroes `OP`
/// entirely if the desired size is zero (S5).
fn finish_pack_forward(gpt: &mut Gpt, desired_op_blocks: u64) -> Result<()> {
    let op_idx = gpt.entries.iter().position(|e| e.name == "OP");
    let userdata_idx = gpt.entries.iter().position(|e| e.name == "userdata");

    let (Some(op_idx), Some(userdata_idx)) = (op_idx, userdata_idx) else {
        debug!("no OP/userdata pair present, nothing to pack-forward");
        return Ok(());
    };

    let op_before_userdata = gpt.entries[op_idx].last_lba + 1 == gpt.entries[userdata_idx].first_lba;
    let userdata_before_op = gpt.entries[userdata_idx].last_lba + 1 == gpt.entries[op_idx].first_lba;
    if !op_before_userdata && !userdata_before_op {
        return Err(Error::geometry("OP and userdata entries are not adjacent"));
    }

    let current_op_blocks = gpt.entries[op_idx].last_lba - gpt.entries[op_idx].first_lba + 1;

    if desired_op_blocks == 0 {
        // userdata absorbs the entire (now zeroed) OP range.
        if op_before_userdata {
            gpt.entries[userdata_idx].first_lba = gpt.entries[op_idx].first_lba;
        } else {
            gpt.entries[userdata_idx].last_lba = gpt.entries[op_idx].last_lba;
        }
        gpt.entries[op_idx] = Entry::empty();
        return Ok(());
    }

    let delta = desired_op_blocks as i64 - current_op_blocks as i64;
    if delta == 0 {
        return Ok(());
    }

    if op_before_userdata {
        let new_op_last = (gpt.entries[op_idx].last_lba as i64 + delta) as u64;
        gpt.entries[op_idx].last_lba = new_op_last;
        gpt.entries[userdata_idx].first_lba = new_op_last + 1;
    } else {
        let new_op_first = (gpt.entries[op_idx].first_lba as i64 - delta) as u64;
        gpt.entries[op_idx].first_lba = new_op_first;
        gpt.entries[userdata_idx].last_lba = new_op_first - 1;
    }

    Ok(())
}

/// pack-reverse: collects relocatable ranked entries, finds maximal
/// contiguous runs, and reorders each run by rank before handing off to
/// pack-forward.
fn finish_pack_reverse(gpt: &mut Gpt) -> Result<()> {
    let mut ranked: Vec<usize> = gpt
        .entries
        .iter()
        .enumerate()
        .filter(|(_, e)| !e.is_empty() && slices::repair_rank(&e.name).is_some())
        .map(|(i, _)| i)
        .collect();
    ranked.sort_by_key(|&i| gpt.entries[i].first_lba);

    let mut run_start = 0usize;
    while run_start < ranked.len() {
        let mut run_end = run_start;
        while run_end + 1 < ranked.len()
            && gpt.entries[ranked[run_end]].last_lba + 1 == gpt.entries[ranked[run_end + 1]].first_lba
        {
            run_end += 1;
        }
        reorder_run_by_rank(gpt, &ranked[run_start..=run_end]);
        run_start = run_end + 1;
    }

    Ok(())
}

fn reorder_run_by_rank(gpt: &mut Gpt, run: &[usize]) {
    if run.len() < 2 {
        return;
    }
    let first_lba = gpt.entries[run[0]].first_lba;
    let mut members: Vec<Entry> = run.iter().map(|&i| gpt.entries[i].clone()).collect();
    members.sort_by_key(|e| slices::repair_rank(&e.name).unwrap_or(u32::MAX));

    let mut lba = first_lba;
    for (slot, member) in run.iter().zip(members.into_iter()) {
        let len = member.last_lba - member.first_lba;
        let mut placed = member;
        placed.first_lba = lba;
        placed.last_lba = lba + len;
        lba = placed.last_lba + 1;
        gpt.entries[*slot] = placed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpt::HeaderBuilder;

    fn gpt_with_entries(entries: Vec<Entry>, lb: LogicalBlockSize) -> Gpt {
        let header = HeaderBuilder::new()
            .disk_guid(uuid::Uuid::new_v4())
            .backup_lba(200_100)
            .num_parts(entries.len().max(128) as u32)
            .build(lb)
            .unwrap();
        let mut full = vec![Entry::empty(); header.num_parts as usize];
        for (i, e) in entries.into_iter().enumerate() {
            full[i] = e;
        }
        Gpt {
            header,
            entries: full,
            lb_size: lb,
        }
    }

    fn entry(name: &str, first: u64, last: u64) -> Entry {
        Entry {
            type_guid: uuid::Uuid::new_v4(),
            unique_guid: uuid::Uuid::new_v4(),
            first_lba: first,
            last_lba: last,
            flags: 0,
            name: name.into(),
        }
    }

    #[test]
    fn scenario_s5_op_zeroed_and_userdata_absorbs_range() {
        let lb = LogicalBlockSize::LB512;
        let mut gpt = gpt_with_entries(
            vec![entry("OP", 90_000, 99_999), entry("userdata", 100_000, 199_999)],
            lb,
        );
        finish_pack_forward(&mut gpt, 0).unwrap();

        let op = gpt.entries.iter().find(|e| e.name == "OP");
        assert!(op.is_none() || op.unwrap().is_empty());
        let userdata = gpt.entries.iter().find(|e| e.name == "userdata").unwrap();
        assert_eq!(userdata.first_lba, 90_000);
        assert_eq!(userdata.last_lba, 199_999);
    }

    #[test]
    fn pack_forward_rejects_non_adjacent_op_and_userdata() {
        let lb = LogicalBlockSize::LB512;
        let mut gpt = gpt_with_entries(
            vec![
                entry("OP", 90_000, 94_999),
                entry("cust", 95_000, 99_999),
                entry("userdata", 100_000, 199_999),
            ],
            lb,
        );
        assert!(finish_pack_forward(&mut gpt, 5_000).is_err());
    }

    #[test]
    fn pack_reverse_reorders_contiguous_run_by_rank() {
        let lb = LogicalBlockSize::LB512;
        // userdata (rank 1) laid out before OP (rank 2) in a contiguous run;
        // pack-reverse should swap them so userdata sorts first... already does.
        // Use cache(5) then system(4) to exercise an actual swap.
        let mut gpt = gpt_with_entries(
            vec![entry("cache", 1000, 1999), entry("system", 2000, 2999)],
            lb,
        );
        finish_pack_reverse(&mut gpt).unwrap();

        let system = gpt.entries.iter().find(|e| e.name == "system").unwrap();
        let cache = gpt.entries.iter().find(|e| e.name == "cache").unwrap();
        assert!(system.first_lba < cache.first_lba);
    }
}
