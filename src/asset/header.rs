use log::{info, warn};
use serde::Deserialize;
use uuid::Uuid;

use crate::asset::types::{MeshProcessResult, SectionKind};
use crate::{MAX_MESH_VERSION, MESH_HEADER_SIZE, NUM_LODS};

pub const FLAG_SKIN_IN_CACHE: u32 = 1 << 0;
pub const FLAG_PHYSICS_CONVEX_IN_CACHE: u32 = 1 << 1;
pub const FLAG_PHYSICS_MESH_IN_CACHE: u32 = 1 << 2;
pub const FLAG_LOD_IN_CACHE: [u32; NUM_LODS] = [1 << 3, 1 << 4, 1 << 5, 1 << 6];

/// Offset/size pair of one sub-section, relative to the end of the
/// header. A size of zero means the sub-section is absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionRange {
    pub offset: u32,
    pub size: u32,
}

impl SectionRange {
    pub fn is_present(&self) -> bool {
        self.size > 0
    }
}

/// Fixed-schema record parsed from the leading structured map of the
/// asset. Also tracks which sub-sections have already landed in the local
/// disk cache.
#[derive(Debug, Clone, Default)]
pub struct MeshHeader {
    pub version: u32,
    /// Byte position the decoder reached, which is where the sub-section
    /// payloads begin. Zero for headers that never validated.
    pub header_size: u32,
    pub skin: SectionRange,
    pub physics_convex: SectionRange,
    pub physics_mesh: SectionRange,
    pub lods: [SectionRange; NUM_LODS],
    /// Asset known to be unavailable, do not retry.
    pub not_found: bool,
    pub skin_in_cache: bool,
    pub physics_convex_in_cache: bool,
    pub physics_mesh_in_cache: bool,
    pub lod_in_cache: [bool; NUM_LODS],
    pub creator: Option<Uuid>,
}

#[derive(Deserialize)]
struct WireRange {
    #[serde(default)]
    offset: u32,
    #[serde(default)]
    size: u32,
}

#[derive(Deserialize)]
struct WireHeader {
    #[serde(default)]
    version: u32,
    creator: Option<Uuid>,
    lowest_lod: Option<WireRange>,
    low_lod: Option<WireRange>,
    medium_lod: Option<WireRange>,
    high_lod: Option<WireRange>,
    skin: Option<WireRange>,
    physics_convex: Option<WireRange>,
    physics_mesh: Option<WireRange>,
}

fn range(wire: Option<WireRange>) -> SectionRange {
    wire.map(|w| SectionRange {
        offset: w.offset,
        size: w.size,
    })
    .unwrap_or_default()
}

/// Older assets carry a textual compatibility line in front of the
/// structured map. It is not part of the header proper and the decoder
/// never sees it, but its length still counts towards the header size
/// since sub-section offsets are relative to the raw asset bytes.
fn strip_legacy_prefix(data: &[u8]) -> &[u8] {
    if data.first() == Some(&b'#') {
        match data.iter().position(|&b| b == b'\n') {
            Some(pos) => &data[pos + 1..],
            None => data,
        }
    } else {
        data
    }
}

impl MeshHeader {
    /// Decodes a header from the first bytes of the asset and applies the
    /// validity gates. `cache_flags` of zero means the caller has no
    /// preamble to trust and presence bits are derived from which
    /// sub-sections already fit inside `data`.
    ///
    /// An empty input produces a header marked unavailable rather than an
    /// error, mirroring what a confirmed-missing asset looks like.
    pub fn from_asset_bytes(
        mesh_id: &Uuid,
        data: &[u8],
        cache_flags: u32,
    ) -> Result<MeshHeader, MeshProcessResult> {
        let mut header = MeshHeader::default();

        if data.is_empty() {
            info!(
                "Non-positive data size, marking mesh {} as non-existent, will not retry",
                mesh_id
            );
            header.not_found = true;
            return Ok(header);
        }

        let stripped = strip_legacy_prefix(data);
        let prefix_len = data.len() - stripped.len();

        let mut stream = serde_json::Deserializer::from_slice(stripped).into_iter::<serde_json::Value>();
        let value = match stream.next() {
            Some(Ok(value)) => value,
            Some(Err(_)) => {
                warn!("Mesh header parse error, not a valid mesh asset. ID: {}", mesh_id);
                return Err(MeshProcessResult::ParseFailure);
            }
            None => return Err(MeshProcessResult::NoData),
        };

        if !value.is_object() {
            warn!("Mesh header is invalid for ID: {}", mesh_id);
            return Err(MeshProcessResult::Invalid);
        }

        let consumed = prefix_len + stream.byte_offset();
        let wire: WireHeader =
            serde_json::from_value(value).map_err(|_| MeshProcessResult::ParseFailure)?;

        header.version = wire.version;
        header.creator = wire.creator;
        header.skin = range(wire.skin);
        header.physics_convex = range(wire.physics_convex);
        header.physics_mesh = range(wire.physics_mesh);
        header.lods = [
            range(wire.lowest_lod),
            range(wire.low_lod),
            range(wire.medium_lod),
            range(wire.high_lod),
        ];

        if header.version > MAX_MESH_VERSION {
            info!("Wrong version in header for {}", mesh_id);
            header.not_found = true;
        } else if consumed > MESH_HEADER_SIZE {
            // the fetch pipeline only ever requests the first 4 KiB, a
            // header past that can never be served
            warn!("Oversized mesh header for {}, marking as non-existent", mesh_id);
            header.not_found = true;
        } else if header.actual_lod(0) >= 0 {
            header.header_size = consumed as u32;

            if cache_flags != 0 {
                header.set_from_flags(cache_flags);
            } else {
                let data_size = data.len();
                let fits = |section: &SectionRange| {
                    section.is_present()
                        && consumed + section.offset as usize + (section.size as usize) < data_size
                };
                header.skin_in_cache = fits(&header.skin);
                header.physics_convex_in_cache = fits(&header.physics_convex);
                header.physics_mesh_in_cache = fits(&header.physics_mesh);
                for i in 0..NUM_LODS {
                    header.lod_in_cache[i] = fits(&header.lods[i]);
                }
            }
        }
        // actual_lod already flagged not_found when no LOD has data

        Ok(header)
    }

    pub fn section(&self, kind: SectionKind) -> SectionRange {
        match kind {
            SectionKind::Skin => self.skin,
            SectionKind::PhysicsConvex => self.physics_convex,
            SectionKind::PhysicsMesh => self.physics_mesh,
            SectionKind::Lod(i) => self.lods[i],
        }
    }

    pub fn section_in_cache(&self, kind: SectionKind) -> bool {
        match kind {
            SectionKind::Skin => self.skin_in_cache,
            SectionKind::PhysicsConvex => self.physics_convex_in_cache,
            SectionKind::PhysicsMesh => self.physics_mesh_in_cache,
            SectionKind::Lod(i) => self.lod_in_cache[i],
        }
    }

    pub fn set_section_in_cache(&mut self, kind: SectionKind, cached: bool) {
        match kind {
            SectionKind::Skin => self.skin_in_cache = cached,
            SectionKind::PhysicsConvex => self.physics_convex_in_cache = cached,
            SectionKind::PhysicsMesh => self.physics_mesh_in_cache = cached,
            SectionKind::Lod(i) => self.lod_in_cache[i] = cached,
        }
    }

    /// Packs the presence bits into the preamble flags word.
    pub fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.skin_in_cache {
            flags |= FLAG_SKIN_IN_CACHE;
        }
        if self.physics_convex_in_cache {
            flags |= FLAG_PHYSICS_CONVEX_IN_CACHE;
        }
        if self.physics_mesh_in_cache {
            flags |= FLAG_PHYSICS_MESH_IN_CACHE;
        }
        for i in 0..NUM_LODS {
            if self.lod_in_cache[i] {
                flags |= FLAG_LOD_IN_CACHE[i];
            }
        }
        flags
    }

    pub fn set_from_flags(&mut self, flags: u32) {
        self.skin_in_cache = flags & FLAG_SKIN_IN_CACHE != 0;
        self.physics_convex_in_cache = flags & FLAG_PHYSICS_CONVEX_IN_CACHE != 0;
        self.physics_mesh_in_cache = flags & FLAG_PHYSICS_MESH_IN_CACHE != 0;
        for i in 0..NUM_LODS {
            self.lod_in_cache[i] = flags & FLAG_LOD_IN_CACHE[i] != 0;
        }
    }

    /// Conservative invalidation after a corrupt cache read: every
    /// sub-section is marked missing.
    pub fn clear_cache_flags(&mut self) {
        self.skin_in_cache = false;
        self.physics_convex_in_cache = false;
        self.physics_mesh_in_cache = false;
        self.lod_in_cache = [false; NUM_LODS];
    }

    /// Resolves the LOD that actually has data for a desired detail
    /// level: the level itself, else the nearest lower, else the nearest
    /// higher. Marks the header unavailable when no LOD has data.
    pub fn actual_lod(&mut self, lod: i32) -> i32 {
        let lod = lod.clamp(0, NUM_LODS as i32 - 1) as usize;

        if self.not_found || self.version > MAX_MESH_VERSION {
            return -1;
        }

        if self.lods[lod].is_present() {
            return lod as i32;
        }

        for i in (0..lod).rev() {
            if self.lods[i].is_present() {
                return i as i32;
            }
        }

        for i in lod + 1..NUM_LODS {
            if self.lods[i].is_present() {
                return i as i32;
            }
        }

        // header exists and no usable LOD was found, treat as missing
        self.not_found = true;
        -1
    }

    /// Absolute end of a sub-section's byte range within the asset.
    fn section_end(&self, section: &SectionRange) -> u64 {
        self.header_size as u64 + section.offset as u64 + section.size as u64
    }

    /// Whether a sub-section's bytes lie entirely inside the first
    /// `window_len` bytes of the asset, which lets the caller consume
    /// them without another round trip.
    pub fn section_in_window(&self, section: &SectionRange, window_len: usize) -> bool {
        section.is_present() && self.section_end(section) <= window_len as u64
    }

    /// Checks the sub-section extents against the asset's total length,
    /// once it is known.
    pub fn extents_valid(&self, total_len: u64) -> bool {
        let sections = [
            self.skin,
            self.physics_convex,
            self.physics_mesh,
            self.lods[0],
            self.lods[1],
            self.lods[2],
            self.lods[3],
        ];
        sections
            .iter()
            .all(|section| !section.is_present() || self.section_end(section) <= total_len)
    }

    /// How many bytes the cache blob needs past the preamble to hold the
    /// header and every declared sub-section.
    pub fn cache_payload_size(&self) -> u64 {
        let mut end = 0u64;
        for section in [self.skin, self.physics_convex, self.physics_mesh]
            .iter()
            .chain(self.lods.iter())
        {
            if section.is_present() {
                end = end.max(section.offset as u64 + section.size as u64);
            }
        }
        self.header_size as u64 + end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::types::LOD_NAMES;
    use serde_json::json;

    fn wire_header(lod_sizes: [u32; NUM_LODS]) -> Vec<u8> {
        let mut map = serde_json::Map::new();
        map.insert("version".into(), json!(1));
        let mut offset = 0u32;
        for (i, size) in lod_sizes.iter().enumerate() {
            map.insert(LOD_NAMES[i].into(), json!({"offset": offset, "size": size}));
            offset += size;
        }
        serde_json::to_vec(&serde_json::Value::Object(map)).expect("serializable")
    }

    #[test]
    fn parses_and_sets_header_size_to_decoder_position() {
        let id = Uuid::new_v4();
        let bytes = wire_header([10, 20, 0, 40]);
        let header = MeshHeader::from_asset_bytes(&id, &bytes, 0).expect("valid header");

        assert_eq!(header.header_size as usize, bytes.len());
        assert_eq!(header.lods[0].size, 10);
        assert_eq!(header.lods[2].size, 0);
        assert!(!header.not_found);
    }

    #[test]
    fn legacy_prefix_counts_towards_header_size() {
        let id = Uuid::new_v4();
        let mut bytes = b"#legacy mesh asset\n".to_vec();
        let body = wire_header([10, 0, 0, 0]);
        bytes.extend_from_slice(&body);

        let header = MeshHeader::from_asset_bytes(&id, &bytes, 0).expect("valid header");
        assert_eq!(header.header_size as usize, bytes.len());
    }

    #[test]
    fn version_gate_marks_not_found() {
        let id = Uuid::new_v4();
        let bytes =
            serde_json::to_vec(&json!({"version": 1000, "high_lod": {"offset": 0, "size": 5}}))
                .expect("serializable");
        let header = MeshHeader::from_asset_bytes(&id, &bytes, 0).expect("stored as 404");
        assert!(header.not_found);
        assert_eq!(header.header_size, 0);
    }

    #[test]
    fn header_without_lods_marks_not_found() {
        let id = Uuid::new_v4();
        let bytes = wire_header([0, 0, 0, 0]);
        let header = MeshHeader::from_asset_bytes(&id, &bytes, 0).expect("stored as 404");
        assert!(header.not_found);
    }

    #[test]
    fn non_object_input_is_invalid() {
        let id = Uuid::new_v4();
        let result = MeshHeader::from_asset_bytes(&id, b"[1, 2, 3]", 0);
        assert_eq!(result.unwrap_err(), MeshProcessResult::Invalid);

        let result = MeshHeader::from_asset_bytes(&id, b"{{nope", 0);
        assert_eq!(result.unwrap_err(), MeshProcessResult::ParseFailure);
    }

    #[test]
    fn empty_input_is_a_missing_asset() {
        let id = Uuid::new_v4();
        let header = MeshHeader::from_asset_bytes(&id, &[], 0).expect("stored as 404");
        assert!(header.not_found);
    }

    #[test]
    fn presence_bits_roundtrip_through_flags_word() {
        let id = Uuid::new_v4();
        let bytes = wire_header([10, 20, 30, 40]);
        let mut header = MeshHeader::from_asset_bytes(&id, &bytes, 0).expect("valid header");
        header.skin_in_cache = true;
        header.lod_in_cache = [true, false, true, false];

        let flags = header.flags();
        let reparsed = MeshHeader::from_asset_bytes(&id, &bytes, flags).expect("valid header");
        assert_eq!(reparsed.flags(), flags);
        assert!(reparsed.skin_in_cache);
        assert_eq!(reparsed.lod_in_cache, [true, false, true, false]);
    }

    #[test]
    fn presence_derived_from_bytes_already_in_hand() {
        let id = Uuid::new_v4();
        let mut bytes = wire_header([8, 8, 8, 8]);
        let header_len = bytes.len();
        // lod0 sits fully inside the buffer, lod1 ends exactly at it
        bytes.resize(header_len + 8 + 8, 0xAB);

        let header = MeshHeader::from_asset_bytes(&id, &bytes, 0).expect("valid header");
        assert!(header.lod_in_cache[0]);
        // the fit check is strict, a section ending exactly at the buffer
        // boundary does not count as cached
        assert!(!header.lod_in_cache[1]);
        assert!(!header.lod_in_cache[2]);
        assert!(!header.lod_in_cache[3]);
    }

    #[test]
    fn header_filling_the_fetch_window_exactly_is_accepted() {
        let id = Uuid::new_v4();
        let mut map = serde_json::Map::new();
        map.insert("version".into(), json!(1));
        map.insert("high_lod".into(), json!({"offset": 0, "size": 64}));
        map.insert("pad".into(), json!(""));
        let bare = serde_json::to_vec(&serde_json::Value::Object(map.clone()))
            .expect("serializable");

        // grow the ignored pad key until the map spans the whole window
        let filler = MESH_HEADER_SIZE - bare.len();
        map.insert("pad".into(), json!("x".repeat(filler)));
        let bytes = serde_json::to_vec(&serde_json::Value::Object(map)).expect("serializable");
        assert_eq!(bytes.len(), MESH_HEADER_SIZE);

        let header = MeshHeader::from_asset_bytes(&id, &bytes, 0).expect("valid header");
        assert!(!header.not_found);
        assert_eq!(header.header_size as usize, MESH_HEADER_SIZE);
    }

    #[test]
    fn header_past_the_fetch_window_is_a_missing_asset() {
        let id = Uuid::new_v4();
        let mut map = serde_json::Map::new();
        map.insert("version".into(), json!(1));
        map.insert("high_lod".into(), json!({"offset": 0, "size": 64}));
        map.insert("pad".into(), json!("x".repeat(MESH_HEADER_SIZE)));
        let bytes = serde_json::to_vec(&serde_json::Value::Object(map)).expect("serializable");

        let header = MeshHeader::from_asset_bytes(&id, &bytes, 0).expect("stored as 404");
        assert!(header.not_found);
        assert_eq!(header.header_size, 0);
    }

    #[test]
    fn actual_lod_searches_down_then_up() {
        let id = Uuid::new_v4();
        let bytes = wire_header([0, 12, 0, 0]);
        let mut header = MeshHeader::from_asset_bytes(&id, &bytes, 0).expect("valid header");

        assert_eq!(header.actual_lod(3), 1);
        assert_eq!(header.actual_lod(0), 1);
        assert_eq!(header.actual_lod(1), 1);
        assert!(!header.not_found);
    }

    #[test]
    fn extents_validate_against_total_length() {
        let id = Uuid::new_v4();
        let bytes = wire_header([16, 0, 0, 0]);
        let header = MeshHeader::from_asset_bytes(&id, &bytes, 0).expect("valid header");

        assert!(header.extents_valid(header.header_size as u64 + 16));
        assert!(!header.extents_valid(header.header_size as u64 + 15));

        // the window fit shares the same arithmetic, absent sections
        // never count as contained
        assert!(header.section_in_window(&header.lods[0], header.header_size as usize + 16));
        assert!(!header.section_in_window(&header.lods[0], header.header_size as usize + 15));
        assert!(!header.section_in_window(&header.lods[1], usize::MAX));
    }
}
