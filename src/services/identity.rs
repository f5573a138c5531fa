// Identity matching - decides whether two partial identities from different
// providers describe the same game, person or character.

use crate::models::{Identity, SourceId};

/// Count of identity fields that agree on both sides.
/// Each shared non-empty external id, the localized name and the display
/// name contribute one point each. Zero means "no evidence".
pub fn similarity(a: &Identity, b: &Identity) -> u32 {
    let mut score = 0;

    for source in SourceId::ALL {
        if let (Some(x), Some(y)) = (a.id(source), b.id(source)) {
            if x == y {
                score += 1;
            }
        }
    }

    if matches!((a.localized(), b.localized()), (Some(x), Some(y)) if x == y) {
        score += 1;
    }
    if matches!((a.name(), b.name()), (Some(x), Some(y)) if x == y) {
        score += 1;
    }

    score
}

/// Strict sameness check.
///
/// When the two sides share any external-id slot, every shared slot must
/// match; one mismatch is enough to say "different". Only when no slot is
/// shared do we fall back to exact display-name equality.
pub fn is_same(a: &Identity, b: &Identity) -> bool {
    let mut shared = 0;

    for source in SourceId::ALL {
        if let (Some(x), Some(y)) = (a.id(source), b.id(source)) {
            if x != y {
                return false;
            }
            shared += 1;
        }
    }

    if shared > 0 {
        return true;
    }

    matches!((a.name(), b.name()), (Some(x), Some(y)) if x == y)
}

/// Best-scoring candidate for `target`. Ties keep the earliest candidate;
/// a zero score is never a match.
pub fn best_match<'a, T, I, F>(candidates: I, target: &Identity, identity: F) -> Option<(&'a T, u32)>
where
    I: IntoIterator<Item = &'a T>,
    F: Fn(&T) -> &Identity,
    T: 'a,
{
    let mut best: Option<(&'a T, u32)> = None;
    for candidate in candidates {
        let score = similarity(identity(candidate), target);
        if score == 0 {
            continue;
        }
        if best.map(|(_, s)| score > s).unwrap_or(true) {
            best = Some((candidate, score));
        }
    }
    best
}

/// Collapse entries that `is_same` considers one entity, keeping the first
/// occurrence and folding later ones into it with `fold`.
pub fn dedup_by_identity<T, F, M>(items: Vec<T>, identity: F, mut fold: M) -> Vec<T>
where
    F: Fn(&T) -> &Identity,
    M: FnMut(&mut T, T),
{
    let mut out: Vec<T> = Vec::with_capacity(items.len());
    for item in items {
        match out
            .iter_mut()
            .find(|kept| is_same(identity(kept), identity(&item)))
        {
            Some(kept) => fold(kept, item),
            None => out.push(item),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(pairs: &[(SourceId, &str)]) -> Identity {
        let mut identity = Identity::default();
        for (source, id) in pairs {
            identity.external_ids.insert(*source, id.to_string());
        }
        identity
    }

    #[test]
    fn test_is_same_requires_all_shared_ids_to_match() {
        let a = ids(&[(SourceId::Bangumi, "1")]);
        let b = ids(&[(SourceId::Bangumi, "1"), (SourceId::Vndb, "9")]);
        let c = ids(&[(SourceId::Bangumi, "2"), (SourceId::Vndb, "9")]);

        assert!(is_same(&a, &b));
        assert!(!is_same(&b, &c));
        assert!(!is_same(&a, &c));
        // b and c still share evidence, it just isn't enough for sameness
        assert_eq!(similarity(&b, &c), 1);
    }

    #[test]
    fn test_is_same_falls_back_to_display_name() {
        let a = Identity::named("Sakura no Uta").with_id(SourceId::Bangumi, "1");
        let b = Identity::named("Sakura no Uta").with_id(SourceId::Vndb, "v2");
        let c = Identity::named("Sakura no Toki").with_id(SourceId::Vndb, "v2");

        assert!(is_same(&a, &b));
        assert!(!is_same(&a, &c));
        assert!(!is_same(&Identity::default(), &Identity::default()));
    }

    #[test]
    fn test_same_name_different_id_is_not_same() {
        let a = Identity::named("Remember").with_id(SourceId::Bangumi, "10");
        let b = Identity::named("Remember").with_id(SourceId::Bangumi, "11");
        assert!(!is_same(&a, &b));
        assert_eq!(similarity(&a, &b), 1);
    }

    #[test]
    fn test_similarity_is_symmetric() {
        let samples = vec![
            Identity::default(),
            Identity::named("A"),
            Identity::named("A").with_localized("甲"),
            ids(&[(SourceId::Bangumi, "1")]),
            ids(&[(SourceId::Bangumi, "1"), (SourceId::Vndb, "9")]),
            ids(&[(SourceId::Bangumi, "2"), (SourceId::Vndb, "9")]),
            Identity::named("A")
                .with_localized("甲")
                .with_id(SourceId::Ymgal, "5"),
        ];

        for a in &samples {
            for b in &samples {
                assert_eq!(similarity(a, b), similarity(b, a));
            }
        }
    }

    #[test]
    fn test_similarity_counts_every_agreeing_field() {
        let a = Identity::named("A")
            .with_localized("甲")
            .with_id(SourceId::Bangumi, "1")
            .with_id(SourceId::Cngal, "3");
        let b = a.clone().with_id(SourceId::Vndb, "v1");
        assert_eq!(similarity(&a, &b), 4);
    }

    #[test]
    fn test_best_match_prefers_first_on_tie() {
        let pool = vec![
            Identity::named("X").with_id(SourceId::Vndb, "1"),
            Identity::named("X").with_id(SourceId::Vndb, "2"),
            Identity::named("Y"),
        ];
        let target = Identity::named("X");
        let (found, score) = best_match(&pool, &target, |i| i).unwrap();
        assert_eq!(score, 1);
        assert_eq!(found.id(SourceId::Vndb), Some("1"));

        assert!(best_match(&pool, &Identity::named("Z"), |i| i).is_none());
    }

    #[test]
    fn test_dedup_folds_duplicates() {
        let items = vec![
            (ids(&[(SourceId::Bangumi, "p1")]), 1),
            (ids(&[(SourceId::Bangumi, "p2")]), 10),
            (ids(&[(SourceId::Bangumi, "p1")]), 2),
        ];
        let out = dedup_by_identity(items, |(i, _)| i, |kept, (_, n)| kept.1 += n);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].1, 3);
        assert_eq!(out[1].1, 10);
    }
}
