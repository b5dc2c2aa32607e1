//! The single authoritative slice table: match-mask, repair-rank, and the
//! ignore-list for entry comparison, keyed by slice name.
//!
//! Historically these lived as separate, drifting tables in different
//! source files; this module is the one place a new device variant's
//! slices get taught to the rest of the crate (§9 Design Notes).

use std::collections::HashMap;
use std::sync::OnceLock;

bitflags::bitflags! {
    /// 3-bit classification of how strictly a slice's content must agree
    /// with the archive (§4.E).
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct MatchMask: u8 {
        /// This chunk must match exactly; divergence is fatal.
        const REQUIRED = 0b001;
        /// This chunk should match; divergence only drops the verdict.
        const ADVISORY = 0b010;
        /// Special-cased GPT comparison applies instead of a byte compare.
        const GPT = 0b100;
    }
}

/// Pack-order rank used by the repair/resizer when reordering relocatable
/// slices (§4.F). Lower sorts first. `0` means "never reordered".
pub type RepairRank = u32;

fn match_table() -> &'static HashMap<&'static str, MatchMask> {
    static TABLE: OnceLock<HashMap<&'static str, MatchMask>> = OnceLock::new();
    TABLE.get_or_init(|| {
        use MatchMask as M;
        let required = M::REQUIRED;
        let advisory = M::ADVISORY;
        let gpt = M::GPT | M::REQUIRED;
        HashMap::from([
            ("BackupGPT", gpt),
            ("PrimaryGPT", gpt),
            ("apdp", advisory),
            ("cmnlib", advisory),
            ("cmnlib64", advisory),
            ("cmnlib64bak", advisory),
            ("cmnlibbak", advisory),
            ("devcfg", advisory),
            ("devcfgbak", advisory),
            ("factory", advisory),
            ("hyp", advisory),
            ("hypbak", advisory),
            ("keymaster", advisory),
            ("keymasterbak", advisory),
            ("laf", advisory),
            ("lafbak", advisory),
            ("msadp", advisory),
            ("pmic", advisory),
            ("pmicbak", advisory),
            ("raw_resources", advisory),
            ("raw_resourcesbak", required | advisory),
            ("rpm", advisory),
            ("rpmbak", advisory),
            ("sec", required | advisory),
            ("tz", advisory),
            ("tzbak", advisory),
            ("xbl", advisory),
            ("xbl2", advisory),
            ("xbl2bak", advisory),
            ("xblbak", advisory),
        ])
    })
}

/// Looks up the match mask for a slice name. `None` means the slice is
/// absent from the table and the chunk is skipped entirely (§4.E).
pub fn match_mask(slice_name: &str) -> Option<MatchMask> {
    match_table().get(slice_name).copied()
}

fn repair_table() -> &'static HashMap<&'static str, RepairRank> {
    static TABLE: OnceLock<HashMap<&'static str, RepairRank>> = OnceLock::new();
    TABLE.get_or_init(|| {
        HashMap::from([
            ("persistent", 0),
            ("userdata", 1),
            ("OP", 2),
            ("cust", 3),
            ("system", 4),
            ("cache", 5),
        ])
    })
}

/// Pack-order rank for a relocatable slice name, or `None` if the repair
/// engine never touches it.
pub fn repair_rank(slice_name: &str) -> Option<RepairRank> {
    repair_table().get(slice_name).copied()
}

/// Slice names whose entries the applicability tester never compares
/// (commonly modified by the user or vendor after first boot): empty name,
/// `OP`, `cache`, `cust`, `grow`..`grow7`, `system`, `userdata` (§4.E).
pub fn is_ignored_for_compare(slice_name: &str) -> bool {
    if slice_name.is_empty() {
        return true;
    }
    if slice_name == "grow" {
        return true;
    }
    if let Some(n) = slice_name.strip_prefix("grow") {
        if let Ok(idx) = n.parse::<u32>() {
            return (2..=7).contains(&idx);
        }
    }
    matches!(slice_name, "OP" | "cache" | "cust" | "system" | "userdata")
}

/// Device index exempted from the unique-ID comparison in the GPT entry
/// walk (a known vendor quirk, named rather than left as a magic number,
/// per §9's open question).
pub const UNIQUE_ID_QUIRK_DEVICE_INDEX: u8 = 6;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpt_slices_are_required_and_special_cased() {
        let m = match_mask("PrimaryGPT").unwrap();
        assert!(m.contains(MatchMask::REQUIRED));
        assert!(m.contains(MatchMask::GPT));
    }

    #[test]
    fn unknown_slice_is_absent() {
        assert!(match_mask("totally_unknown_slice").is_none());
    }

    #[test]
    fn ignore_list_covers_grow_range() {
        assert!(is_ignored_for_compare(""));
        assert!(is_ignored_for_compare("grow"));
        assert!(is_ignored_for_compare("grow2"));
        assert!(is_ignored_for_compare("grow7"));
        assert!(!is_ignored_for_compare("grow8"));
        assert!(is_ignored_for_compare("userdata"));
        assert!(!is_ignored_for_compare("boot"));
    }

    #[test]
    fn repair_ranks_match_the_known_table() {
        assert_eq!(repair_rank("persistent"), Some(0));
        assert_eq!(repair_rank("userdata"), Some(1));
        assert_eq!(repair_rank("OP"), Some(2));
        assert_eq!(repair_rank("boot"), None);
    }
}
