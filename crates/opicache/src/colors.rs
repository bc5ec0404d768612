//! `cache_mtd.json`: the R → G → B → image-id color registry.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::overviews::Rgb;

/// Reserved for unowned graph pixels; never assigned.
pub const BACKGROUND: Rgb = [0, 0, 0];

/// Injective map from graph colors to image identifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColorRegistry {
    tree: BTreeMap<u8, BTreeMap<u8, BTreeMap<u8, String>>>,
}

impl ColorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn contains(&self, [r, g, b]: Rgb) -> bool {
        self.owner([r, g, b]).is_some()
    }

    /// Image owning `color`, if any.
    pub fn owner(&self, [r, g, b]: Rgb) -> Option<&str> {
        self.tree
            .get(&r)
            .and_then(|gs| gs.get(&g))
            .and_then(|bs| bs.get(&b))
            .map(String::as_str)
    }

    /// Records `color → image_id`, returning the previous owner if the color
    /// was taken.
    pub fn insert(&mut self, [r, g, b]: Rgb, image_id: &str) -> Option<String> {
        self.tree
            .entry(r)
            .or_default()
            .entry(g)
            .or_default()
            .insert(b, image_id.to_owned())
    }

    /// Draws uniform triples until one is free, records it for `image_id` and
    /// returns it.
    ///
    /// Loops forever once all 256³ − 1 colors are taken; caches stay many
    /// orders of magnitude below that.
    pub fn assign<R: Rng + ?Sized>(&mut self, image_id: &str, rng: &mut R) -> Rgb {
        loop {
            let color: Rgb = [rng.gen(), rng.gen(), rng.gen()];
            if color != BACKGROUND && !self.contains(color) {
                self.insert(color, image_id);
                return color;
            }
        }
    }

    /// Every `(color, image_id)` pair, in color order.
    pub fn iter(&self) -> impl Iterator<Item = (Rgb, &str)> + '_ {
        self.tree.iter().flat_map(|(&r, gs)| {
            gs.iter().flat_map(move |(&g, bs)| {
                bs.iter().map(move |(&b, id)| ([r, g, b], id.as_str()))
            })
        })
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    #[test]
    fn ten_thousand_assignments_never_collide() {
        let mut reg = ColorRegistry::new();
        let mut rng = StdRng::seed_from_u64(7);
        let mut seen = HashSet::new();
        for i in 0..10_000 {
            let c = reg.assign(&format!("IMG_{i}"), &mut rng);
            assert_ne!(c, BACKGROUND);
            assert!(seen.insert(c));
        }
        assert_eq!(reg.len(), 10_000);
    }

    #[test]
    fn owner_reverse_lookup() {
        let mut reg = ColorRegistry::new();
        assert!(reg.insert([1, 2, 3], "A").is_none());
        assert_eq!(reg.owner([1, 2, 3]), Some("A"));
        assert_eq!(reg.owner([1, 2, 4]), None);
        assert_eq!(reg.insert([1, 2, 3], "B").as_deref(), Some("A"));
    }

    #[test]
    fn json_is_nested_by_channel() {
        let mut reg = ColorRegistry::new();
        reg.insert([10, 20, 30], "A");
        reg.insert([10, 21, 5], "B");
        let v = serde_json::to_value(&reg).unwrap();
        assert_eq!(v["10"]["20"]["30"], "A");
        assert_eq!(v["10"]["21"]["5"], "B");

        let back: ColorRegistry = serde_json::from_value(v).unwrap();
        assert_eq!(back, reg);
        assert_eq!(back.iter().count(), 2);
    }
}
