use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use gallery::feature::{FeatureBlob, FloatVector, DIMENSIONS};
use gallery::loader::{GroupRow, TemplateRow};
use gallery::types::{Template, TemplateRecord};

/// Deterministic pseudo-random feature for `seed`.
pub fn feature(seed: u64) -> FeatureBlob {
    FeatureBlob::from_floats(&floats(seed))
}

pub fn floats(seed: u64) -> FloatVector {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut v = [0.0f32; DIMENSIONS];
    for x in v.iter_mut() {
        *x = rng.gen_range(-1.0..1.0);
    }
    v
}

/// `base` plus a little noise: scores high against `base` but not 1.0.
pub fn near(base: u64, noise_seed: u64, noise: f32) -> FeatureBlob {
    let mut rng = StdRng::seed_from_u64(noise_seed);
    let mut v = floats(base);
    for x in v.iter_mut() {
        *x += rng.gen_range(-noise..noise);
    }
    FeatureBlob::from_floats(&v)
}

pub fn template(id: &str, owner: &str, seed: u64, groups: &[&str]) -> Template {
    Template::new(
        id,
        owner,
        feature(seed),
        groups.iter().map(|g| g.to_string()).collect(),
    )
}

pub fn record(id: &str, owner: &str, seed: u64, groups: &[&str]) -> TemplateRecord {
    TemplateRecord::from(&template(id, owner, seed, groups))
}

/// Backing-store snapshot: `n` templates over `n / 3` owners, each owner in
/// one or two groups, plus one row of each reject kind.
pub fn snapshot(n: usize) -> (Vec<GroupRow>, Vec<TemplateRow>) {
    let owners = (n / 3).max(1);
    let mut groups = Vec::new();
    for o in 0..owners {
        groups.push(GroupRow {
            owner_id: format!("owner-{o}"),
            group_id: format!("group-{}", o % 5),
        });
        if o % 2 == 0 {
            groups.push(GroupRow {
                owner_id: format!("owner-{o}"),
                group_id: "even".to_string(),
            });
        }
    }

    let mut templates: Vec<TemplateRow> = (0..n)
        .map(|i| TemplateRow {
            id: Some(format!("tpl-{i}")),
            owner_id: Some(format!("owner-{}", i % owners)),
            feature: Some(feature(i as u64).as_bytes().to_vec()),
        })
        .collect();
    templates.push(TemplateRow {
        id: None,
        owner_id: Some("owner-0".into()),
        feature: Some(vec![0; 512]),
    });
    templates.push(TemplateRow {
        id: Some("no-feature".into()),
        owner_id: Some("owner-0".into()),
        feature: None,
    });
    templates.push(TemplateRow {
        id: Some("short-feature".into()),
        owner_id: Some("owner-0".into()),
        feature: Some(vec![1; 100]),
    });
    (groups, templates)
}
