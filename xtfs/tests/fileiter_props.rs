//! Property tests for offset resolution over random extent tables

use proptest::prelude::*;
use xtfs::config::BufCacheConfig;
use xtfs::xtfs_api::{BLOCKSIZE, EXTENT_SIZE, NDIRECT};
use xtfs::{BufCache, Extent, FileIter, InodeRef, RamDisk};

const B: u64 = BLOCKSIZE as u64;
const INDIRECT_BLOCK: u32 = 2;

/// Extent table with each extent's starting file offset
struct Model {
    extents: Vec<(u64, Extent)>,
    end: u64,
}

impl Model {
    fn new(shape: &[(bool, u32)]) -> Self {
        let mut extents = Vec::new();
        let mut eoff = 0;
        let mut next_block = 100;
        for &(hole, count) in shape {
            let ext = if hole {
                Extent::hole(count)
            } else {
                next_block += count;
                Extent::new(next_block - count, count)
            };
            extents.push((eoff, ext));
            eoff += ext.span();
        }
        Self { extents, end: eoff }
    }

    /// (index, start offset, extent) covering `off`
    fn lookup(&self, off: u64) -> Option<(usize, u64, Extent)> {
        self.extents
            .iter()
            .enumerate()
            .find(|(_, (eoff, ext))| off >= *eoff && off < eoff + ext.span())
            .map(|(i, &(eoff, ext))| (i, eoff, ext))
    }
}

fn build<'c>(bc: &'c BufCache, model: &Model) -> InodeRef<'c> {
    let ino = InodeRef::load(bc, 1, 0).unwrap();
    let mut w = ino.lock();
    w.clear();
    w.set_size(model.end as u32);
    for (i, (_, ext)) in model.extents.iter().take(NDIRECT).enumerate() {
        w.set_direct(i, *ext);
    }
    if model.extents.len() > NDIRECT {
        w.set_indirect(INDIRECT_BLOCK);
        let block = bc.load(INDIRECT_BLOCK).unwrap().unwrap();
        let mut data = block.lock_buffer();
        data.fill(0);
        for (i, (_, ext)) in model.extents.iter().skip(NDIRECT).enumerate() {
            ext.encode(&mut data[i * EXTENT_SIZE..(i + 1) * EXTENT_SIZE]);
        }
    }
    drop(w);
    ino
}

fn cache() -> BufCache {
    BufCache::new(Box::new(RamDisk::new(16)), BufCacheConfig::with_nbuf(8)).unwrap()
}

fn extent_shapes() -> impl Strategy<Value = Vec<(bool, u32)>> {
    proptest::collection::vec((proptest::bool::weighted(0.25), 1u32..4), 0..24)
}

/// Observable resolution of an iterator
fn snapshot(it: &FileIter<'_, '_>) -> (u64, usize, u64, Option<Extent>, u32, bool, bool) {
    (
        it.offset(),
        it.extent_index(),
        it.extent_offset(),
        it.extent(),
        it.blocknum(),
        it.active(),
        it.empty(),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn find_sets_offset_and_block(shape in extent_shapes(), probes in proptest::collection::vec(0u64..1000, 1..32)) {
        let bc = cache();
        let model = Model::new(&shape);
        let ino = build(&bc, &model);
        let mut it = FileIter::new(&ino, 0);

        for probe in probes {
            let off = probe * (model.end + 2 * B) / 1000;
            it.find(off);
            prop_assert_eq!(it.offset(), off);
            prop_assert_eq!(it.block_relative_offset(), (off % B) as usize);
            match model.lookup(off) {
                Some((idx, eoff, ext)) => {
                    prop_assert!(it.active());
                    prop_assert_eq!(it.extent_index(), idx);
                    prop_assert_eq!(it.extent_offset(), eoff);
                    prop_assert_eq!(it.extent(), Some(ext));
                    let expected = if ext.is_hole() { 0 } else { ext.first + ((off - eoff) / B) as u32 };
                    prop_assert_eq!(it.blocknum(), expected);
                }
                None => {
                    prop_assert!(!it.active());
                    prop_assert_eq!(it.blocknum(), 0);
                }
            }
        }
    }

    #[test]
    fn next_visits_every_extent_once(shape in extent_shapes()) {
        let bc = cache();
        let model = Model::new(&shape);
        let ino = build(&bc, &model);
        let mut it = FileIter::new(&ino, 0);

        let mut seen = Vec::new();
        while it.active() {
            prop_assert!(seen.len() <= model.extents.len());
            seen.push((it.offset(), it.extent().unwrap()));
            it.next();
        }
        prop_assert_eq!(seen, model.extents.clone());
        prop_assert_eq!(it.offset(), model.end);
    }

    #[test]
    fn find_is_independent_of_prior_state(
        shape in extent_shapes(),
        start in 0u64..1000,
        target in 0u64..1000,
    ) {
        let bc = cache();
        let model = Model::new(&shape);
        let ino = build(&bc, &model);
        let scale = |p: u64| p * (model.end + 2 * B) / 1000;

        let mut warm = FileIter::new(&ino, scale(start));
        warm.find(scale(target));
        let mut cold = FileIter::new(&ino, 0);
        cold.find(scale(target));
        prop_assert_eq!(snapshot(&warm), snapshot(&cold));
    }
}
