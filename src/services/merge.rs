// Merge engine - reconciles provider fragments into one canonical record.
//
// Scalar fields are taken from the first provider in that field's priority
// order with a real (non-placeholder) value. List fields take the whole list
// of one provider. The result never depends on fetch completion order.

use futures::future::join_all;
use serde::Deserialize;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::identity::{dedup_by_identity, is_same};
use super::sources::{FieldPriority, MetadataSource, Related, SourceRegistry, ThrottlePolicy};
use crate::error::MergeError;
use crate::models::{
    CanonicalRecord, Character, Field, FieldKind, Fragment, Identity, Known, SourceId, StaffCredit,
};

pub const DEFAULT_DEVELOPER_THRESHOLD: f64 = 0.75;

/// A known producer and the spellings it appears under in tags.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Producer {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProducerTable {
    producers: Vec<Producer>,
}

impl ProducerTable {
    pub fn new(producers: Vec<Producer>) -> Self {
        Self { producers }
    }

    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    /// Closest producer to `tag` on a 0..1 scale. Ties keep the producer
    /// listed first.
    pub fn best_match(&self, tag: &str) -> Option<(&str, f64)> {
        let mut best: Option<(&str, f64)> = None;
        for producer in &self.producers {
            let spellings = std::iter::once(&producer.name).chain(producer.aliases.iter());
            for spelling in spellings {
                let score = strsim::normalized_levenshtein(tag.trim(), spelling.trim());
                if best.map(|(_, s)| score > s).unwrap_or(true) {
                    best = Some((producer.name.as_str(), score));
                }
            }
        }
        best
    }
}

pub struct MergeResolver {
    producers: ProducerTable,
    developer_threshold: f64,
}

impl MergeResolver {
    pub fn new(producers: ProducerTable, developer_threshold: f64) -> Self {
        Self {
            producers,
            developer_threshold,
        }
    }

    /// Build a fresh record from `fragments`. Absent fragments (`None`) are
    /// providers that had nothing or failed.
    pub fn merge(
        &self,
        priority: &FieldPriority,
        id: Uuid,
        identity: &Identity,
        fragments: &[(SourceId, Option<Fragment>)],
    ) -> Result<CanonicalRecord, MergeError> {
        let mut record = assemble(priority, id, identity, fragments)?;
        self.fill_developer(&mut record);
        Ok(record)
    }

    /// Merge `fragments` over an existing record. Fields the new merge knows
    /// replace the stored ones; fields it doesn't know are kept. Characters
    /// keep detail already resolved for them.
    pub fn remerge(
        &self,
        priority: &FieldPriority,
        record: &mut CanonicalRecord,
        fragments: &[(SourceId, Option<Fragment>)],
    ) -> Result<(), MergeError> {
        let mut fresh = assemble(priority, record.id, &record.identity, fragments)?;

        if let (Some(characters), Some(stored)) =
            (fresh.characters.value_mut(), record.characters.value())
        {
            for character in characters.iter_mut() {
                let resolved = stored
                    .iter()
                    .find(|old| is_same(&old.identity, &character.identity));
                if let Some(old) = resolved {
                    character.absorb(old);
                }
            }
        }

        overlay(&mut record.name, fresh.name);
        overlay(&mut record.localized_name, fresh.localized_name);
        overlay(&mut record.description, fresh.description);
        overlay(&mut record.developer, fresh.developer);
        overlay(&mut record.cover_url, fresh.cover_url);
        overlay(&mut record.release_date, fresh.release_date);
        overlay(&mut record.rating, fresh.rating);
        overlay(&mut record.expected_play_hours, fresh.expected_play_hours);
        overlay(&mut record.tags, fresh.tags);
        overlay(&mut record.characters, fresh.characters);
        overlay(&mut record.staff, fresh.staff);

        let mut identity = fresh.identity;
        identity.absorb(&record.identity);
        record.identity = identity;

        // Only after the overlay, so a developer stored earlier wins over a
        // guess from the new tags.
        self.fill_developer(record);

        Ok(())
    }

    fn fill_developer(&self, record: &mut CanonicalRecord) {
        if record.developer.is_placeholder() {
            record.developer = self.developer_from_tags(&record.tags);
        }
    }

    fn developer_from_tags(&self, tags: &Field<Vec<String>>) -> Field<String> {
        let Field::Known { value: tags, source } = tags else {
            return Field::Placeholder;
        };

        let mut best: Option<(&str, f64)> = None;
        for tag in tags {
            if let Some((name, score)) = self.producers.best_match(tag) {
                if best.map(|(_, s)| score > s).unwrap_or(true) {
                    best = Some((name, score));
                }
            }
        }

        match best {
            Some((name, score)) if score >= self.developer_threshold => {
                tracing::debug!(
                    "Developer inferred from tags: {} (similarity {:.2})",
                    name,
                    score
                );
                Field::Known {
                    value: name.to_string(),
                    source: *source,
                }
            }
            _ => Field::Placeholder,
        }
    }
}

/// Field-by-field merge without the developer fallback.
fn assemble(
    priority: &FieldPriority,
    id: Uuid,
    identity: &Identity,
    fragments: &[(SourceId, Option<Fragment>)],
) -> Result<CanonicalRecord, MergeError> {
    let mut present: BTreeMap<SourceId, &Fragment> = BTreeMap::new();
    for (source, fragment) in fragments {
        if let Some(fragment) = fragment {
            present.entry(*source).or_insert(fragment);
        }
    }

    if present.is_empty() {
        return Err(MergeError::NotFound(identity.label()));
    }

    let pick_order = |field| priority.order(field);

    let mut record = CanonicalRecord {
        id,
        identity: identity.clone(),
        name: pick(&present, &pick_order(FieldKind::Name), |f| {
            f.identity.display_name.as_ref()
        }),
        localized_name: pick(&present, &pick_order(FieldKind::LocalizedName), |f| {
            f.identity.localized_name.as_ref()
        }),
        description: pick(&present, &pick_order(FieldKind::Description), |f| {
            f.description.as_ref()
        }),
        developer: pick(&present, &pick_order(FieldKind::Developer), |f| {
            f.developer.as_ref()
        }),
        cover_url: pick(&present, &pick_order(FieldKind::CoverImage), |f| {
            f.cover_url.as_ref()
        }),
        release_date: pick(&present, &pick_order(FieldKind::ReleaseDate), |f| {
            f.release_date.as_ref()
        }),
        rating: pick(&present, &pick_order(FieldKind::Rating), |f| f.rating.as_ref()),
        expected_play_hours: pick(&present, &pick_order(FieldKind::PlayTime), |f| {
            f.expected_play_hours.as_ref()
        }),
        tags: pick(&present, &pick_order(FieldKind::Tags), |f| f.tags.as_ref()),
        characters: pick(&present, &pick_order(FieldKind::Characters), |f| {
            f.characters.as_ref()
        }),
        staff: pick(&present, &pick_order(FieldKind::Staff), |f| f.staff.as_ref()),
        updated_at: None,
    };

    // Ids from every answering provider, walked in name priority so the
    // result is stable.
    for source in pick_order(FieldKind::Name) {
        if let Some(fragment) = present.get(&source) {
            record.identity.absorb(&fragment.identity);
        }
    }
    if let Some(name) = record.name.value() {
        record.identity.display_name = Some(name.clone());
    }
    if let Some(name) = record.localized_name.value() {
        record.identity.localized_name = Some(name.clone());
    }

    if let Some(characters) = record.characters.value_mut() {
        *characters = dedup_characters(std::mem::take(characters));
    }
    if let Some(staff) = record.staff.value_mut() {
        *staff = dedup_staff(std::mem::take(staff));
    }

    Ok(record)
}

fn pick<T, F>(present: &BTreeMap<SourceId, &Fragment>, order: &[SourceId], get: F) -> Field<T>
where
    T: Known + Clone,
    F: Fn(&Fragment) -> Option<&T>,
{
    for source in order {
        if let Some(value) = present.get(source).and_then(|f| get(*f)) {
            if value.is_known() {
                return Field::Known {
                    value: value.clone(),
                    source: *source,
                };
            }
        }
    }
    Field::Placeholder
}

fn overlay<T>(target: &mut Field<T>, fresh: Field<T>) {
    if !fresh.is_placeholder() {
        *target = fresh;
    }
}

fn dedup_characters(characters: Vec<Character>) -> Vec<Character> {
    dedup_by_identity(characters, |c| &c.identity, |kept, dup| kept.absorb(&dup))
}

fn dedup_staff(staff: Vec<StaffCredit>) -> Vec<StaffCredit> {
    dedup_by_identity(
        staff,
        |c| &c.person.identity,
        |kept, dup| {
            kept.roles.extend(dup.roles);
            kept.person.identity.absorb(&dup.person.identity);
            if kept.person.image_url.is_none() {
                kept.person.image_url = dup.person.image_url;
            }
            if kept.person.description.is_none() {
                kept.person.description = dup.person.description;
            }
        },
    )
}

/// Ask every registered provider about `identity` concurrently.
///
/// Providers are asked by id when the identity carries one for them, by name
/// otherwise. Failures are logged and count as "no fragment". The result is
/// in registry order regardless of which provider answered first.
pub async fn fetch_fragments(
    registry: &SourceRegistry,
    identity: &Identity,
    policy: &ThrottlePolicy,
    on_wait: &(dyn Fn(SourceId, u64) + Sync),
) -> Vec<(SourceId, Option<Fragment>)> {
    let lookups = registry.sources().map(|source| async move {
        let fragment = fetch_one(source.as_ref(), identity, policy, on_wait).await;
        (source.id(), fragment)
    });

    join_all(lookups).await
}

async fn fetch_one(
    source: &dyn MetadataSource,
    identity: &Identity,
    policy: &ThrottlePolicy,
    on_wait: &(dyn Fn(SourceId, u64) + Sync),
) -> Option<Fragment> {
    let provider = source.id();
    let label = identity.label();

    let result = if let Some(id) = identity.id(provider) {
        policy.call(|secs| on_wait(provider, secs), || source.fetch_by_id(id)).await
    } else if let (Some(name), true) = (identity.name(), source.supports_search()) {
        policy.call(|secs| on_wait(provider, secs), || source.fetch_by_name(name)).await
    } else {
        return None;
    };

    let mut fragment = match result {
        Ok(Some(fragment)) => fragment,
        Ok(None) => {
            tracing::debug!("No {} match for: {}", provider, label);
            return None;
        }
        Err(e) => {
            tracing::warn!("{} lookup failed for {}: {}", provider, label, e);
            return None;
        }
    };

    if let Some(related) = source.as_related() {
        let external_id = fragment
            .identity
            .id(provider)
            .or_else(|| identity.id(provider))
            .map(str::to_string);

        if let Some(external_id) = external_id {
            match policy
                .call(|secs| on_wait(provider, secs), || related.fetch_related(&external_id))
                .await
            {
                Ok(items) => attach_related(&mut fragment, items),
                Err(e) => {
                    tracing::warn!("{} related lookup failed for {}: {}", provider, label, e)
                }
            }
        }
    }

    Some(fragment)
}

fn attach_related(fragment: &mut Fragment, items: Vec<Related>) {
    let mut staff = Vec::new();
    let mut characters = Vec::new();
    for item in items {
        match item {
            Related::Person(credit) => staff.push(credit),
            Related::Character(character) => characters.push(character),
        }
    }
    if !staff.is_empty() {
        fragment.staff = Some(staff);
    }
    if !characters.is_empty() {
        fragment.characters = Some(characters);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Role, RoleSet};
    use crate::test_support::FakeSource;
    use chrono::NaiveDate;
    use std::sync::Arc;

    fn resolver() -> MergeResolver {
        MergeResolver::new(
            ProducerTable::new(vec![
                Producer {
                    name: "Moonstudio".to_string(),
                    aliases: vec![],
                },
                Producer {
                    name: "Key".to_string(),
                    aliases: vec!["Visual Art's/Key".to_string()],
                },
            ]),
            DEFAULT_DEVELOPER_THRESHOLD,
        )
    }

    fn priority() -> FieldPriority {
        FieldPriority::new(vec![SourceId::Bangumi, SourceId::Vndb, SourceId::Ymgal])
            .with_field(FieldKind::CoverImage, vec![SourceId::Vndb])
    }

    fn bangumi() -> Fragment {
        Fragment {
            identity: Identity::named("Sakura no Uta").with_id(SourceId::Bangumi, "100"),
            description: Some("bgm summary".to_string()),
            developer: Some("???".to_string()),
            cover_url: Some("https://bgm/cover.jpg".to_string()),
            rating: Some(7.9),
            tags: Some(vec!["MoonStudio".to_string(), "Romance".to_string()]),
            ..Default::default()
        }
    }

    fn vndb() -> Fragment {
        Fragment {
            identity: Identity::named("Sakura no Uta -Sakura no Mori")
                .with_id(SourceId::Vndb, "v17"),
            description: Some("vndb summary".to_string()),
            cover_url: Some("https://vndb/cover.jpg".to_string()),
            release_date: NaiveDate::from_ymd_opt(2015, 10, 30),
            tags: Some(vec!["Drama".to_string()]),
            ..Default::default()
        }
    }

    fn ymgal() -> Fragment {
        Fragment {
            identity: Identity::named("樱之诗").with_id(SourceId::Ymgal, "7"),
            expected_play_hours: Some(40.0),
            rating: Some(0.0),
            ..Default::default()
        }
    }

    fn all_fragments() -> Vec<(SourceId, Option<Fragment>)> {
        vec![
            (SourceId::Ymgal, Some(ymgal())),
            (SourceId::Vndb, Some(vndb())),
            (SourceId::Bangumi, Some(bangumi())),
            (SourceId::Cngal, None),
        ]
    }

    #[test]
    fn test_all_absent_is_not_found() {
        let err = resolver()
            .merge(
                &priority(),
                Uuid::nil(),
                &Identity::named("Nothing"),
                &[(SourceId::Bangumi, None), (SourceId::Vndb, None)],
            )
            .unwrap_err();
        assert!(matches!(err, MergeError::NotFound(name) if name == "Nothing"));
    }

    #[test]
    fn test_fields_follow_priority_and_skip_placeholders() {
        let record = resolver()
            .merge(&priority(), Uuid::nil(), &Identity::default(), &all_fragments())
            .unwrap();

        assert_eq!(record.name.value().unwrap(), "Sakura no Uta");
        assert_eq!(record.name.source(), Some(SourceId::Bangumi));
        assert_eq!(record.description.source(), Some(SourceId::Bangumi));
        // cover prefers VNDB via override
        assert_eq!(record.cover_url.source(), Some(SourceId::Vndb));
        assert_eq!(record.release_date.source(), Some(SourceId::Vndb));
        assert_eq!(record.expected_play_hours.source(), Some(SourceId::Ymgal));
        // ymgal's 0.0 rating is a placeholder, bangumi's real rating wins anyway
        assert_eq!(record.rating.value(), Some(&7.9));
        // whole list from one provider, no interleaving
        assert_eq!(
            record.tags.value().unwrap(),
            &vec!["MoonStudio".to_string(), "Romance".to_string()]
        );
        assert!(record.localized_name.is_placeholder());
        assert_eq!(record.identity.id(SourceId::Vndb), Some("v17"));
        assert_eq!(record.identity.id(SourceId::Ymgal), Some("7"));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let resolver = resolver();
        let id = Uuid::new_v4();
        let identity = Identity::named("Sakura no Uta");
        let a = resolver
            .merge(&priority(), id, &identity, &all_fragments())
            .unwrap();
        let b = resolver
            .merge(&priority(), id, &identity, &all_fragments())
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_input_order_does_not_matter() {
        let resolver = resolver();
        let mut reversed = all_fragments();
        reversed.reverse();
        let a = resolver
            .merge(&priority(), Uuid::nil(), &Identity::default(), &all_fragments())
            .unwrap();
        let b = resolver
            .merge(&priority(), Uuid::nil(), &Identity::default(), &reversed)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_dropping_unselected_low_priority_fragment_changes_nothing_it_did_not_supply() {
        let resolver = resolver();
        let full = resolver
            .merge(&priority(), Uuid::nil(), &Identity::default(), &all_fragments())
            .unwrap();

        let without_ymgal: Vec<_> = all_fragments()
            .into_iter()
            .filter(|(s, _)| *s != SourceId::Ymgal)
            .collect();
        let partial = resolver
            .merge(&priority(), Uuid::nil(), &Identity::default(), &without_ymgal)
            .unwrap();

        assert_eq!(full.name, partial.name);
        assert_eq!(full.description, partial.description);
        assert_eq!(full.cover_url, partial.cover_url);
        assert_eq!(full.rating, partial.rating);
        assert_eq!(full.tags, partial.tags);
        // the one field ymgal actually supplied falls back to placeholder
        assert!(partial.expected_play_hours.is_placeholder());
    }

    #[test]
    fn test_developer_fallback_from_tags() {
        let record = resolver()
            .merge(&priority(), Uuid::nil(), &Identity::default(), &all_fragments())
            .unwrap();
        assert_eq!(record.developer.value().unwrap(), "Moonstudio");
        assert_eq!(record.developer.source(), Some(SourceId::Bangumi));
    }

    #[test]
    fn test_developer_fallback_needs_threshold() {
        let mut fragment = bangumi();
        fragment.tags = Some(vec!["Romance".to_string(), "School".to_string()]);
        let record = resolver()
            .merge(
                &priority(),
                Uuid::nil(),
                &Identity::default(),
                &[(SourceId::Bangumi, Some(fragment))],
            )
            .unwrap();
        assert!(record.developer.is_placeholder());
    }

    #[test]
    fn test_real_developer_is_not_replaced_by_tags() {
        let mut fragment = bangumi();
        fragment.developer = Some("Frontwing".to_string());
        let record = resolver()
            .merge(
                &priority(),
                Uuid::nil(),
                &Identity::default(),
                &[(SourceId::Bangumi, Some(fragment))],
            )
            .unwrap();
        assert_eq!(record.developer.value().unwrap(), "Frontwing");
    }

    #[test]
    fn test_nested_lists_are_deduplicated() {
        let mut fragment = bangumi();
        fragment.characters = Some(vec![
            Character {
                identity: Identity::named("Rina").with_id(SourceId::Bangumi, "c1"),
                ..Default::default()
            },
            Character {
                identity: Identity::named("Rina").with_id(SourceId::Bangumi, "c1"),
                description: Some("Second sighting".to_string()),
                ..Default::default()
            },
            Character {
                identity: Identity::named("Rina").with_id(SourceId::Bangumi, "c2"),
                ..Default::default()
            },
        ]);
        fragment.staff = Some(vec![
            StaffCredit::new(Identity::default().with_id(SourceId::Bangumi, "p1"), Role::Writer),
            StaffCredit::new(Identity::default().with_id(SourceId::Bangumi, "p1"), Role::Artist),
        ]);

        let record = resolver()
            .merge(
                &priority(),
                Uuid::nil(),
                &Identity::default(),
                &[(SourceId::Bangumi, Some(fragment))],
            )
            .unwrap();

        let characters = record.characters.value().unwrap();
        assert_eq!(characters.len(), 2);
        assert_eq!(
            characters[0].description.as_deref(),
            Some("Second sighting")
        );

        let staff = record.staff.value().unwrap();
        assert_eq!(staff.len(), 1);
        assert_eq!(staff[0].roles, RoleSet::from([Role::Writer, Role::Artist]));
    }

    #[test]
    fn test_remerge_keeps_fields_the_new_fetch_lacks() {
        let resolver = resolver();
        let mut record = resolver
            .merge(&priority(), Uuid::nil(), &Identity::default(), &all_fragments())
            .unwrap();

        let mut update = vndb();
        update.description = Some("updated vndb summary".to_string());
        resolver
            .remerge(&priority(), &mut record, &[(SourceId::Vndb, Some(update))])
            .unwrap();

        assert_eq!(record.description.value().unwrap(), "updated vndb summary");
        assert_eq!(record.description.source(), Some(SourceId::Vndb));
        // only ymgal ever knew the play time
        assert_eq!(record.expected_play_hours.value(), Some(&40.0));
        assert_eq!(record.identity.id(SourceId::Bangumi), Some("100"));
    }

    #[test]
    fn test_remerge_does_not_replace_known_developer_with_tag_guess() {
        let resolver = resolver();
        let mut with_developer = vndb();
        with_developer.developer = Some("Frontwing".to_string());
        let mut record = resolver
            .merge(
                &priority(),
                Uuid::nil(),
                &Identity::default(),
                &[(SourceId::Vndb, Some(with_developer))],
            )
            .unwrap();
        assert_eq!(record.developer.value().unwrap(), "Frontwing");

        // bangumi only has a "???" developer and a MoonStudio tag
        resolver
            .remerge(&priority(), &mut record, &[(SourceId::Bangumi, Some(bangumi()))])
            .unwrap();
        assert_eq!(record.developer.value().unwrap(), "Frontwing");
        assert_eq!(record.developer.source(), Some(SourceId::Vndb));
    }

    #[test]
    fn test_remerge_infers_developer_when_still_unknown() {
        let resolver = resolver();
        let mut record = resolver
            .merge(&priority(), Uuid::nil(), &Identity::default(), &[(SourceId::Ymgal, Some(ymgal()))])
            .unwrap();
        assert!(record.developer.is_placeholder());

        resolver
            .remerge(&priority(), &mut record, &[(SourceId::Bangumi, Some(bangumi()))])
            .unwrap();
        assert_eq!(record.developer.value().unwrap(), "Moonstudio");
    }

    #[test]
    fn test_remerge_keeps_resolved_character_detail() {
        let resolver = resolver();
        let rina = || Character {
            identity: Identity::named("Rina").with_id(SourceId::Bangumi, "c1"),
            ..Default::default()
        };
        let mut fragment = bangumi();
        fragment.characters = Some(vec![rina()]);
        let mut record = resolver
            .merge(
                &priority(),
                Uuid::nil(),
                &Identity::default(),
                &[(SourceId::Bangumi, Some(fragment.clone()))],
            )
            .unwrap();

        // detail filled in later by a character lookup
        let stored = record.characters.value_mut().unwrap();
        stored[0].description = Some("A girl who paints".to_string());
        stored[0].image_url = Some("https://img/c1.jpg".to_string());

        fragment.characters = Some(vec![
            rina(),
            Character {
                identity: Identity::named("Kanon").with_id(SourceId::Bangumi, "c2"),
                ..Default::default()
            },
        ]);
        resolver
            .remerge(&priority(), &mut record, &[(SourceId::Bangumi, Some(fragment))])
            .unwrap();

        let characters = record.characters.value().unwrap();
        assert_eq!(characters.len(), 2);
        assert_eq!(characters[0].description.as_deref(), Some("A girl who paints"));
        assert_eq!(characters[0].image_url.as_deref(), Some("https://img/c1.jpg"));
        assert!(!characters[0].needs_detail());
        assert!(characters[1].needs_detail());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_fragments_reports_throttle_countdown() {
        let mut registry = SourceRegistry::new(priority());
        registry.register(Arc::new(
            FakeSource::new(SourceId::Bangumi)
                .with_game("100", bangumi())
                .throttle_first(1),
        ));
        let policy = ThrottlePolicy {
            cooldown: std::time::Duration::from_secs(2),
            ..ThrottlePolicy::default()
        };

        let waits = std::sync::Mutex::new(Vec::new());
        let fragments = fetch_fragments(
            &registry,
            &Identity::default().with_id(SourceId::Bangumi, "100"),
            &policy,
            &|source, secs| waits.lock().unwrap().push((source, secs)),
        )
        .await;

        assert!(fragments[0].1.is_some());
        assert_eq!(
            *waits.lock().unwrap(),
            vec![(SourceId::Bangumi, 2), (SourceId::Bangumi, 1)]
        );
    }

    #[tokio::test]
    async fn test_fetch_fragments_absorbs_failures_and_keeps_registry_order() {
        let mut registry = SourceRegistry::new(priority());
        registry.register(Arc::new(
            FakeSource::new(SourceId::Bangumi).failing_with("connection reset"),
        ));
        registry.register(Arc::new(
            FakeSource::new(SourceId::Vndb)
                .with_game_by_name("Sakura no Uta", vndb())
                .delayed(std::time::Duration::from_millis(20)),
        ));
        registry.register(Arc::new(FakeSource::new(SourceId::Ymgal)));

        let fragments = fetch_fragments(
            &registry,
            &Identity::named("Sakura no Uta"),
            &ThrottlePolicy::default(),
            &|_, _| {},
        )
        .await;

        let sources: Vec<SourceId> = fragments.iter().map(|(s, _)| *s).collect();
        assert_eq!(
            sources,
            vec![SourceId::Bangumi, SourceId::Vndb, SourceId::Ymgal]
        );
        assert!(fragments[0].1.is_none());
        assert!(fragments[1].1.is_some());
        assert!(fragments[2].1.is_none());

        let record = resolver()
            .merge(&priority(), Uuid::nil(), &Identity::named("Sakura no Uta"), &fragments)
            .unwrap();
        assert_eq!(record.description.source(), Some(SourceId::Vndb));
    }

    #[tokio::test]
    async fn test_fetch_fragments_attaches_related() {
        let mut registry = SourceRegistry::new(priority());
        registry.register(Arc::new(
            FakeSource::new(SourceId::Bangumi)
                .with_game("100", bangumi())
                .with_related(
                    "100",
                    vec![
                        Related::Person(StaffCredit::new(
                            Identity::named("Sca-ji").with_id(SourceId::Bangumi, "p1"),
                            Role::Writer,
                        )),
                        Related::Character(Character {
                            identity: Identity::named("Rina").with_id(SourceId::Bangumi, "c1"),
                            ..Default::default()
                        }),
                    ],
                ),
        ));

        let fragments = fetch_fragments(
            &registry,
            &Identity::default().with_id(SourceId::Bangumi, "100"),
            &ThrottlePolicy::default(),
            &|_, _| {},
        )
        .await;

        let fragment = fragments[0].1.as_ref().unwrap();
        assert_eq!(fragment.staff.as_ref().unwrap().len(), 1);
        assert_eq!(fragment.characters.as_ref().unwrap().len(), 1);
    }
}
