use std::collections::{BTreeMap, HashMap};

use facemask_gltf::MeshMorphTargets;

/// Morph-target influence vectors, one per mesh of a single asset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MorphInfluences {
    meshes: BTreeMap<String, Vec<f32>>,
}

impl MorphInfluences {
    /// The rest weights the asset was authored with.
    pub fn defaults<'a>(meshes: impl IntoIterator<Item = &'a MeshMorphTargets>) -> Self {
        Self {
            meshes: meshes.into_iter()
                .map(|m| (m.id.clone(), m.default_weights.clone()))
                .collect(),
        }
    }

    pub fn get(&self, mesh: &str) -> Option<&[f32]> {
        self.meshes.get(mesh).map(|v| v.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[f32])> {
        self.meshes.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty()
    }
}

/// Maps tracker blendshape scores onto the morph targets of every mesh.
///
/// Categories a mesh does not name are skipped; assets expose different
/// subsets of expressions and that is expected. Indices outside a mesh's
/// influence vector are skipped as well. Influences not named by `scores`
/// keep their value from `current`.
pub fn map_expressions(
    scores: &HashMap<String, f32>,
    meshes: &[MeshMorphTargets],
    current: &MorphInfluences,
) -> MorphInfluences {
    let mut next = BTreeMap::new();
    for mesh in meshes {
        let mut influence = current.get(&mesh.id)
            .map(|v| v.to_vec())
            .unwrap_or_else(|| mesh.default_weights.clone());

        for (name, score) in scores {
            let Some(index) = mesh.index_of(name) else {
                continue;
            };
            if let Some(slot) = influence.get_mut(index) {
                *slot = clamp_score(*score);
            }
        }
        next.insert(mesh.id.clone(), influence);
    }
    MorphInfluences { meshes: next }
}

fn clamp_score(score: f32) -> f32 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}
