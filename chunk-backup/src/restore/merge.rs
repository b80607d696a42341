//! Interval overlay of a backup chain.
//!
//! Manifests are applied oldest first. Each chunk object overwrites whatever
//! range it covers: segments it intersects are cut back to their leading and
//! trailing remainders, which keep pointing at the older object. The result
//! is a disjoint, offset-ordered list of segments, each a window into one
//! stored object.

use crate::executor::manifest::{ChunkObject, Manifest, MANIFEST_VERSION};
use crate::{BackupError, Result};
use std::collections::BTreeMap;

/// A stored chunk object and where to find it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub container: String,
    pub backup_id: String,
    pub chunk: ChunkObject,
}

/// A window `[offset, offset + length)` of the volume served by one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub offset: u64,
    pub length: u64,
    /// Index into [`SegmentMap::objects`]
    pub object: usize,
}

impl Segment {
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }
}

/// Disjoint segments keyed by their start offset.
#[derive(Debug, Default)]
pub struct SegmentMap {
    segments: BTreeMap<u64, Segment>,
    objects: Vec<ObjectRef>,
}

impl SegmentMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overlay an object on top of the current segments.
    pub fn insert(&mut self, object: ObjectRef) {
        let start = object.chunk.offset;
        let end = object.chunk.end();
        if start >= end {
            return;
        }

        let index = self.objects.len();
        self.objects.push(object);

        // Only the segment starting before `start` can reach into the new range
        // from the left; everything else that intersects starts inside it.
        let mut hits: Vec<Segment> = Vec::new();
        if let Some((_, before)) = self.segments.range(..start).next_back() {
            if before.end() > start {
                hits.push(*before);
            }
        }
        hits.extend(self.segments.range(start..end).map(|(_, segment)| *segment));

        for hit in hits {
            self.segments.remove(&hit.offset);
            if hit.offset < start {
                self.put(hit.offset, start, hit.object);
            }
            if hit.end() > end {
                self.put(end, hit.end(), hit.object);
            }
        }

        self.put(start, end, index);
    }

    fn put(&mut self, start: u64, end: u64, object: usize) {
        self.segments.insert(
            start,
            Segment {
                offset: start,
                length: end - start,
                object,
            },
        );
    }

    /// Segments in ascending offset order.
    pub fn segments(&self) -> impl Iterator<Item = &Segment> + '_ {
        self.segments.values()
    }

    pub fn object(&self, index: usize) -> &ObjectRef {
        &self.objects[index]
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Total bytes covered by segments.
    pub fn covered_bytes(&self) -> u64 {
        self.segments.values().map(|s| s.length).sum()
    }

    /// End of the last segment, or 0 when empty.
    pub fn end(&self) -> u64 {
        self.segments
            .values()
            .next_back()
            .map(Segment::end)
            .unwrap_or(0)
    }
}

/// Applies one manifest format to a segment map.
pub trait ManifestOverlay: Send + Sync {
    fn overlay(&self, map: &mut SegmentMap, container: &str, manifest: &Manifest);
}

/// Version 1.0.0: objects are applied in manifest order.
struct OverlayV1;

impl ManifestOverlay for OverlayV1 {
    fn overlay(&self, map: &mut SegmentMap, container: &str, manifest: &Manifest) {
        for chunk in &manifest.objects {
            map.insert(ObjectRef {
                container: container.to_string(),
                backup_id: manifest.backup_id.clone(),
                chunk: chunk.clone(),
            });
        }
    }
}

static OVERLAYS: &[(&str, &dyn ManifestOverlay)] = &[(MANIFEST_VERSION, &OverlayV1)];

/// Look up the overlay for a manifest version.
pub fn overlay_for(version: &str) -> Result<&'static dyn ManifestOverlay> {
    OVERLAYS
        .iter()
        .find(|(known, _)| *known == version)
        .map(|(_, overlay)| *overlay)
        .ok_or_else(|| BackupError::UnsupportedVersion(version.to_string()))
}

/// One backup of a chain: its manifest and the container holding its objects.
#[derive(Debug, Clone)]
pub struct ChainMember {
    pub container: String,
    pub manifest: Manifest,
}

/// Merge a chain, root full backup first.
///
/// Every version is resolved before anything is merged, so an unknown
/// version anywhere in the chain fails the whole merge.
pub fn merge_chain(chain: &[ChainMember]) -> Result<SegmentMap> {
    let overlays = chain
        .iter()
        .map(|member| overlay_for(&member.manifest.version))
        .collect::<Result<Vec<_>>>()?;

    let mut map = SegmentMap::new();
    for (member, overlay) in chain.iter().zip(overlays) {
        overlay.overlay(&mut map, &member.container, &member.manifest);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Compression;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn chunk(name: &str, offset: u64, length: u64) -> ChunkObject {
        ChunkObject {
            name: name.to_string(),
            offset,
            length,
            compression: Compression::None,
            md5: String::new(),
        }
    }

    fn manifest(backup_id: &str, objects: Vec<ChunkObject>) -> Manifest {
        Manifest {
            backup_description: None,
            backup_id: backup_id.to_string(),
            backup_name: None,
            created_at: "2024-01-01 00:00:00.000000".to_string(),
            extra_metadata: None,
            objects,
            parent_id: None,
            version: MANIFEST_VERSION.to_string(),
            volume_id: "vol".to_string(),
            volume_meta: None,
        }
    }

    fn member(manifest: Manifest) -> ChainMember {
        ChainMember {
            container: "c".to_string(),
            manifest,
        }
    }

    /// (offset, end, backup) with adjacent segments of the same backup joined.
    fn coalesced(map: &SegmentMap) -> Vec<(u64, u64, String)> {
        let mut out: Vec<(u64, u64, String)> = Vec::new();
        for segment in map.segments() {
            let backup = &map.object(segment.object).backup_id;
            match out.last_mut() {
                Some(last) if last.1 == segment.offset && &last.2 == backup => {
                    last.1 = segment.end()
                }
                _ => out.push((segment.offset, segment.end(), backup.clone())),
            }
        }
        out
    }

    fn assert_disjoint_sorted(map: &SegmentMap) {
        let segments: Vec<_> = map.segments().collect();
        for pair in segments.windows(2) {
            assert!(pair[0].end() <= pair[1].offset, "{:?} overlaps {:?}", pair[0], pair[1]);
        }
        for segment in &segments {
            assert!(segment.length > 0);
            let object = &map.object(segment.object).chunk;
            assert!(object.offset <= segment.offset && segment.end() <= object.end());
        }
    }

    #[test]
    fn test_concrete_chain() {
        let b1 = manifest(
            "B1",
            vec![chunk("b1-1", 0, 8), chunk("b1-2", 8, 8), chunk("b1-3", 16, 8)],
        );
        let b2 = manifest("B2", vec![chunk("b2-1", 8, 4)]);

        let map = merge_chain(&[member(b1), member(b2)]).unwrap();
        assert_disjoint_sorted(&map);
        assert_eq!(
            coalesced(&map),
            vec![
                (0, 8, "B1".to_string()),
                (8, 12, "B2".to_string()),
                (12, 24, "B1".to_string()),
            ]
        );

        // The trailing remainder still reads from the middle of b1-2
        let tail = map.segments().nth(2).unwrap();
        assert_eq!((tail.offset, tail.length), (12, 4));
        assert_eq!(map.object(tail.object).chunk.name, "b1-2");
    }

    #[test]
    fn test_object_spanning_several_segments() {
        let mut map = SegmentMap::new();
        for (i, offset) in [0u64, 4, 8, 12].into_iter().enumerate() {
            map.insert(ObjectRef {
                container: "c".to_string(),
                backup_id: "old".to_string(),
                chunk: chunk(&format!("old-{}", i), offset, 4),
            });
        }
        map.insert(ObjectRef {
            container: "c".to_string(),
            backup_id: "new".to_string(),
            chunk: chunk("new", 2, 12),
        });

        assert_disjoint_sorted(&map);
        let spans: Vec<_> = map
            .segments()
            .map(|s| (s.offset, s.end(), map.object(s.object).chunk.name.clone()))
            .collect();
        assert_eq!(
            spans,
            vec![
                (0, 2, "old-0".to_string()),
                (2, 14, "new".to_string()),
                (14, 16, "old-3".to_string()),
            ]
        );
    }

    #[test]
    fn test_new_object_inside_one_segment() {
        let mut map = SegmentMap::new();
        let object = |backup: &str, name: &str, offset, length| ObjectRef {
            container: "c".to_string(),
            backup_id: backup.to_string(),
            chunk: chunk(name, offset, length),
        };
        map.insert(object("a", "a", 0, 100));
        map.insert(object("b", "b", 40, 10));

        assert_eq!(map.len(), 3);
        assert_eq!(map.covered_bytes(), 100);
        assert_eq!(map.end(), 100);
    }

    #[test]
    fn test_gaps_are_preserved() {
        let map = merge_chain(&[member(manifest(
            "a",
            vec![chunk("x", 0, 4), chunk("y", 10, 4)],
        ))])
        .unwrap();
        let spans: Vec<_> = map.segments().map(|s| (s.offset, s.end())).collect();
        assert_eq!(spans, vec![(0, 4), (10, 14)]);
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let mut newer = manifest("b", vec![chunk("x", 0, 4)]);
        newer.version = "2.0.0".to_string();

        let err = merge_chain(&[member(manifest("a", vec![])), member(newer)]).unwrap_err();
        assert!(matches!(err, BackupError::UnsupportedVersion(v) if v == "2.0.0"));
        assert!(overlay_for(MANIFEST_VERSION).is_ok());
    }

    #[test]
    fn test_random_chains_keep_invariants() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        const SIZE: usize = 512;

        for _ in 0..50 {
            let mut chain = Vec::new();
            // Expected owner of every byte, replayed naively
            let mut owner: Vec<Option<(usize, usize)>> = vec![None; SIZE];

            for b in 0..rng.random_range(1..6) {
                let mut objects = Vec::new();
                for o in 0..rng.random_range(0..8) {
                    let offset = rng.random_range(0..SIZE - 1);
                    let length = rng.random_range(1..=(SIZE - offset).min(64));
                    objects.push(chunk(&format!("{}-{}", b, o), offset as u64, length as u64));
                    for slot in &mut owner[offset..offset + length] {
                        *slot = Some((b, o));
                    }
                }
                chain.push(member(manifest(&b.to_string(), objects)));
            }

            let map = merge_chain(&chain).unwrap();
            assert_disjoint_sorted(&map);

            let mut actual: Vec<Option<(usize, usize)>> = vec![None; SIZE];
            for segment in map.segments() {
                let name = &map.object(segment.object).chunk.name;
                let (b, o) = name.split_once('-').unwrap();
                let id = (b.parse().unwrap(), o.parse().unwrap());
                for slot in &mut actual[segment.offset as usize..segment.end() as usize] {
                    *slot = Some(id);
                }
            }
            assert_eq!(actual, owner);
        }
    }
}
