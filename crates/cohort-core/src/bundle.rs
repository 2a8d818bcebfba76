//! Bundle partitioning and 1-based index resolution.
//!
//! Bundle `k` of size `B` always covers units `[(k-1)*B + 1, k*B]` of the
//! identity-ordered manifest, clipped to the unit count, whichever backend
//! ends up executing it.

use crate::error::{Error, Result};
use crate::identity::UnitIdentity;
use crate::manifest::FlatManifest;
use crate::resource::ResourcePool;
use serde::Serialize;
use std::ops::RangeInclusive;

#[derive(Debug, Clone)]
pub struct Bundle {
    index: usize,
    units: Vec<(UnitIdentity, ResourcePool)>,
}

impl Bundle {
    pub fn new(index: usize, units: Vec<(UnitIdentity, ResourcePool)>) -> Self {
        Self { index, units }
    }

    /// 1-based position of the bundle in the run.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn units(&self) -> &[(UnitIdentity, ResourcePool)] {
        &self.units
    }

    pub fn identities(&self) -> Vec<UnitIdentity> {
        self.units.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn into_units(self) -> Vec<(UnitIdentity, ResourcePool)> {
        self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Which slice of the manifest a single invocation executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitSelector {
    Bundle(usize),
    Unit(usize),
}

pub fn partition_bundles(manifest: &FlatManifest, units_per_bundle: usize) -> Result<Vec<Bundle>> {
    if units_per_bundle == 0 {
        return Err(Error::config("units per bundle must be at least 1"));
    }
    let mut bundles = Vec::with_capacity(bundle_count(manifest.len(), units_per_bundle));
    let mut current = Vec::with_capacity(units_per_bundle);
    for (id, pool) in manifest {
        current.push((id.clone(), pool.clone()));
        if current.len() == units_per_bundle {
            let units = std::mem::replace(&mut current, Vec::with_capacity(units_per_bundle));
            bundles.push(Bundle::new(bundles.len() + 1, units));
        }
    }
    if !current.is_empty() {
        bundles.push(Bundle::new(bundles.len() + 1, current));
    }
    if bundles.is_empty() {
        return Err(Error::config("no bundles created"));
    }
    Ok(bundles)
}

pub fn bundle_count(unit_count: usize, units_per_bundle: usize) -> usize {
    if units_per_bundle == 0 {
        return 0;
    }
    unit_count.div_ceil(units_per_bundle)
}

/// Inclusive 1-based unit range of bundle `bundle_index`.
pub fn bundle_range(
    bundle_index: usize,
    units_per_bundle: usize,
    unit_count: usize,
) -> Result<RangeInclusive<usize>> {
    if bundle_index == 0 {
        return Err(Error::config("bundle indices start at 1"));
    }
    if units_per_bundle == 0 {
        return Err(Error::config("units per bundle must be at least 1"));
    }
    let first = (bundle_index - 1)
        .checked_mul(units_per_bundle)
        .map(|start| start + 1)
        .ok_or_else(|| Error::config(format!("bundle index {} is out of range", bundle_index)))?;
    if first > unit_count {
        return Err(Error::config(format!(
            "bundle {} starts at unit {} but only {} units exist",
            bundle_index, first, unit_count
        )));
    }
    let last = bundle_index.saturating_mul(units_per_bundle).min(unit_count);
    Ok(first..=last)
}

/// Validates a 1-based single-unit index.
pub fn unit_position(unit_index: usize, unit_count: usize) -> Result<usize> {
    if unit_index == 0 || unit_index > unit_count {
        return Err(Error::config(format!(
            "unit index {} is outside 1..={}",
            unit_index, unit_count
        )));
    }
    Ok(unit_index)
}

pub fn selector_range(
    selector: UnitSelector,
    units_per_bundle: usize,
    unit_count: usize,
) -> Result<RangeInclusive<usize>> {
    match selector {
        UnitSelector::Bundle(k) => bundle_range(k, units_per_bundle, unit_count),
        UnitSelector::Unit(i) => unit_position(i, unit_count).map(|i| i..=i),
    }
}

/// Picks the slice of `manifest` a selector denotes. A single-unit request
/// yields a bundle whose index is the unit index.
pub fn select_bundle(
    manifest: &FlatManifest,
    selector: UnitSelector,
    units_per_bundle: usize,
) -> Result<Bundle> {
    let range = selector_range(selector, units_per_bundle, manifest.len())?;
    let index = match selector {
        UnitSelector::Bundle(k) => k,
        UnitSelector::Unit(i) => i,
    };
    let units = manifest
        .iter()
        .skip(range.start() - 1)
        .take(range.end() - range.start() + 1)
        .map(|(id, pool)| (id.clone(), pool.clone()))
        .collect();
    Ok(Bundle::new(index, units))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceValue;

    fn manifest(n: usize) -> FlatManifest {
        (1..=n)
            .map(|i| {
                let mut pool = ResourcePool::new();
                pool.add(
                    "anatomical_scan",
                    ResourceValue::Path(format!("/data/sub_{:02}.nii", i).into()),
                );
                (UnitIdentity::new(format!("sub_{:02}", i), None, None), pool)
            })
            .collect()
    }

    #[test]
    fn partitions_cover_manifest_without_overlap() {
        for m in 1..=12 {
            for b in 1..=6 {
                let flat = manifest(m);
                let bundles = partition_bundles(&flat, b).expect("partition");
                assert_eq!(bundles.len(), bundle_count(m, b), "m={} b={}", m, b);
                let sizes: Vec<usize> = bundles.iter().map(Bundle::len).collect();
                let (last, rest) = sizes.split_last().unwrap();
                assert!(rest.iter().all(|&s| s == b), "m={} b={} {:?}", m, b, sizes);
                assert!(*last >= 1 && *last <= b);
                let all: Vec<UnitIdentity> =
                    bundles.iter().flat_map(|bundle| bundle.identities()).collect();
                let expected: Vec<UnitIdentity> = flat.keys().cloned().collect();
                assert_eq!(all, expected);
                let indices: Vec<usize> = bundles.iter().map(Bundle::index).collect();
                assert_eq!(indices, (1..=bundles.len()).collect::<Vec<_>>());
            }
        }
    }

    #[test]
    fn five_units_in_pairs() {
        let bundles = partition_bundles(&manifest(5), 2).expect("partition");
        let sizes: Vec<usize> = bundles.iter().map(Bundle::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(bundle_range(2, 2, 5).unwrap(), 3..=4);
        assert_eq!(bundle_range(3, 2, 5).unwrap(), 5..=5);
    }

    #[test]
    fn small_manifest_yields_one_bundle() {
        let bundles = partition_bundles(&manifest(3), 10).expect("partition");
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].len(), 3);
        assert_eq!(bundle_range(1, 10, 3).unwrap(), 1..=3);
    }

    #[test]
    fn zero_bundle_size_and_empty_manifest_are_rejected() {
        assert!(matches!(
            partition_bundles(&manifest(3), 0),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            partition_bundles(&FlatManifest::new(), 2),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn consecutive_ranges_partition_unit_span() {
        for m in 1..=20 {
            for b in 1..=7 {
                let mut next = 1;
                for k in 1..=bundle_count(m, b) {
                    let range = bundle_range(k, b, m).expect("range");
                    assert_eq!(*range.start(), next, "m={} b={} k={}", m, b, k);
                    assert_eq!(*range.start(), (k - 1) * b + 1);
                    assert_eq!(*range.end(), (k * b).min(m));
                    next = range.end() + 1;
                }
                assert_eq!(next, m + 1);
                assert!(bundle_range(bundle_count(m, b) + 1, b, m).is_err());
            }
        }
        assert!(bundle_range(0, 2, 5).is_err());
    }

    #[test]
    fn selection_matches_partitioning() {
        let flat = manifest(7);
        let bundles = partition_bundles(&flat, 3).expect("partition");
        for bundle in &bundles {
            let selected =
                select_bundle(&flat, UnitSelector::Bundle(bundle.index()), 3).expect("select");
            assert_eq!(selected.identities(), bundle.identities());
        }
        let single = select_bundle(&flat, UnitSelector::Unit(4), 3).expect("unit");
        assert_eq!(single.len(), 1);
        assert_eq!(single.identities()[0].subject(), "sub_04");
        assert!(select_bundle(&flat, UnitSelector::Unit(8), 3).is_err());
        assert!(select_bundle(&flat, UnitSelector::Unit(0), 3).is_err());
    }
}
