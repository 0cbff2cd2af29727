//! Persistence / retention rules.
//!
//! A [`PersistenceRule`] bounds how many storages of one [`ArchiveType`] are
//! kept and for how long. `min_keep`/`max_keep`/`max_age_days` are `None`
//! for the config-file sentinels `*`/"all"/"unlimited"/"forever".

use crate::catalog::ArchiveType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceRule {
    pub id: i64,
    pub archive_type: ArchiveType,
    /// `None` means "all" (`minKeep=*` in the config file).
    pub min_keep: Option<u32>,
    /// `None` means "unlimited" (`maxKeep=*` in the config file).
    pub max_keep: Option<u32>,
    /// `None` means "forever" (`maxAge=*` in the config file).
    pub max_age_days: Option<u32>,
}

impl PersistenceRule {
    /// Dedup key used when migrating deprecated per-schedule keep/age
    /// fields into standalone rules.
    fn dedup_key(&self) -> (ArchiveType, Option<u32>, Option<u32>, Option<u32>) {
        (self.archive_type, self.min_keep, self.max_keep, self.max_age_days)
    }
}

/// One storage under consideration for retention, ordered youngest-first by
/// the caller before calling [`eligible_for_purge`].
#[derive(Debug, Clone)]
pub struct RetentionCandidate {
    pub storage_id: i64,
    pub created_at: i64,
}

/// Appends `rule` to `rules` unless an identical `(archiveType, minKeep,
/// maxKeep, maxAge)` tuple is already present.
pub fn insert_deduped(rules: &mut Vec<PersistenceRule>, rule: PersistenceRule) {
    if !rules.iter().any(|r| r.dedup_key() == rule.dedup_key()) {
        rules.push(rule);
    }
}

/// Returns the storage ids from `candidates` (must already be sorted
/// youngest-first) that `rule` allows to be purged: at least `min_keep` are
/// always retained; of the remainder, any whose age in days exceeds
/// `max_age_days` are eligible, bounded so that no more than `max_keep`
/// total survive.
pub fn eligible_for_purge(
    rule: &PersistenceRule,
    candidates: &[RetentionCandidate],
    now_epoch: i64,
) -> Vec<i64> {
    let min_keep = rule.min_keep.unwrap_or(candidates.len() as u32) as usize;
    let max_keep = rule.max_keep.map(|v| v as usize).unwrap_or(usize::MAX);

    let mut purge = Vec::new();
    let mut kept = 0usize;

    for (index, candidate) in candidates.iter().enumerate() {
        if index < min_keep {
            kept += 1;
            continue;
        }

        let age_days = (now_epoch - candidate.created_at).max(0) / 86_400;
        let too_old = rule
            .max_age_days
            .map(|max_age| age_days > max_age as i64)
            .unwrap_or(false);
        let over_cap = kept >= max_keep;

        if too_old || over_cap {
            purge.push(candidate.storage_id);
        } else {
            kept += 1;
        }
    }

    purge
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates() -> Vec<RetentionCandidate> {
        // Youngest first, one per day going back.
        (0..10)
            .map(|i| RetentionCandidate {
                storage_id: i as i64,
                created_at: 1_700_000_000 - i * 86_400,
            })
            .collect()
    }

    #[test]
    fn min_keep_protects_youngest() {
        let rule = PersistenceRule {
            id: 1,
            archive_type: ArchiveType::Full,
            min_keep: Some(3),
            max_keep: None,
            max_age_days: Some(0),
        };
        let purge = eligible_for_purge(&rule, &candidates(), 1_700_000_000);
        assert!(!purge.contains(&0));
        assert!(!purge.contains(&1));
        assert!(!purge.contains(&2));
        assert!(purge.contains(&9));
    }

    #[test]
    fn max_keep_caps_total_survivors() {
        let rule = PersistenceRule {
            id: 1,
            archive_type: ArchiveType::Full,
            min_keep: Some(1),
            max_keep: Some(4),
            max_age_days: None,
        };
        let purge = eligible_for_purge(&rule, &candidates(), 1_700_000_000);
        assert_eq!(purge.len(), candidates().len() - 4);
    }

    #[test]
    fn sentinel_all_and_forever_keep_everything() {
        let rule = PersistenceRule {
            id: 1,
            archive_type: ArchiveType::Full,
            min_keep: None,
            max_keep: None,
            max_age_days: None,
        };
        let purge = eligible_for_purge(&rule, &candidates(), 1_700_000_000);
        assert!(purge.is_empty());
    }

    #[test]
    fn dedup_on_insert() {
        let mut rules = Vec::new();
        let r1 = PersistenceRule { id: 1, archive_type: ArchiveType::Full, min_keep: Some(1), max_keep: Some(2), max_age_days: Some(30) };
        let r2 = PersistenceRule { id: 2, archive_type: ArchiveType::Full, min_keep: Some(1), max_keep: Some(2), max_age_days: Some(30) };
        insert_deduped(&mut rules, r1);
        insert_deduped(&mut rules, r2);
        assert_eq!(rules.len(), 1);
    }
}
