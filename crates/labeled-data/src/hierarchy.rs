use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{integrity, Result};

/// Fixed label tree. Every leaf maps to exactly one root-to-leaf path and all
/// paths share the same depth.
///
/// Level 0 is the coarsest level; level `depth - 1` holds the leaves. Label
/// ids are dense per level and assigned in first-seen order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelHierarchy {
    levels: Vec<Vec<String>>,
    /// `paths[leaf_id]` holds one id per level, ending with `leaf_id`.
    paths: Vec<Vec<u32>>,
}

impl LabelHierarchy {
    pub fn from_paths<I, P, S>(paths: I) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut depth: Option<usize> = None;
        let mut levels: Vec<Vec<String>> = Vec::new();
        let mut lookup: Vec<HashMap<String, u32>> = Vec::new();
        let mut leaf_paths: Vec<Vec<u32>> = Vec::new();

        for path in paths {
            let names: Vec<String> = path.into_iter().map(Into::into).collect();
            if names.is_empty() {
                return Err(integrity("label path must not be empty"));
            }
            match depth {
                None => {
                    depth = Some(names.len());
                    levels = vec![Vec::new(); names.len()];
                    lookup = vec![HashMap::new(); names.len()];
                }
                Some(expected) if expected != names.len() => {
                    return Err(integrity(format!(
                        "label path {:?} has depth {}, expected {}",
                        names,
                        names.len(),
                        expected
                    )));
                }
                Some(_) => {}
            }

            let ids: Vec<u32> = names
                .iter()
                .enumerate()
                .map(|(level, name)| {
                    if let Some(id) = lookup[level].get(name) {
                        return *id;
                    }
                    let id = levels[level].len() as u32;
                    levels[level].push(name.clone());
                    lookup[level].insert(name.clone(), id);
                    id
                })
                .collect();

            let leaf = *ids.last().unwrap_or(&0) as usize;
            if leaf < leaf_paths.len() {
                if leaf_paths[leaf] != ids {
                    return Err(integrity(format!(
                        "leaf '{}' appears under two different ancestor paths",
                        names[names.len() - 1]
                    )));
                }
            } else {
                leaf_paths.push(ids);
            }
        }

        if levels.is_empty() {
            return Err(integrity("label hierarchy requires at least one path"));
        }

        Ok(Self {
            levels,
            paths: leaf_paths,
        })
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn level_size(&self, level: usize) -> usize {
        self.levels.get(level).map(Vec::len).unwrap_or(0)
    }

    pub fn level_sizes(&self) -> Vec<usize> {
        self.levels.iter().map(Vec::len).collect()
    }

    pub fn leaf_count(&self) -> usize {
        self.paths.len()
    }

    pub fn leaf_id(&self, name: &str) -> Option<u32> {
        let leaves = self.levels.last()?;
        leaves.iter().position(|n| n == name).map(|id| id as u32)
    }

    /// Root-to-leaf label ids for a leaf.
    pub fn path(&self, leaf_id: u32) -> Option<&[u32]> {
        self.paths.get(leaf_id as usize).map(Vec::as_slice)
    }

    pub fn label_name(&self, level: usize, id: u32) -> Option<&str> {
        self.levels
            .get(level)
            .and_then(|names| names.get(id as usize))
            .map(String::as_str)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        let hierarchy: Self = serde_json::from_slice(&bytes)?;
        if hierarchy.levels.is_empty()
            || hierarchy.paths.iter().any(|p| p.len() != hierarchy.levels.len())
        {
            return Err(integrity(format!(
                "hierarchy file {} is malformed",
                path.display()
            )));
        }
        Ok(hierarchy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sections() -> LabelHierarchy {
        LabelHierarchy::from_paths(vec![
            vec!["background", "objective"],
            vec!["background", "motivation"],
            vec!["method", "design"],
            vec!["background", "objective"],
        ])
        .unwrap()
    }

    #[test]
    fn resolves_paths_for_leaves() {
        let hierarchy = sections();
        assert_eq!(hierarchy.depth(), 2);
        assert_eq!(hierarchy.level_sizes(), vec![2, 3]);
        let design = hierarchy.leaf_id("design").unwrap();
        assert_eq!(hierarchy.path(design).unwrap(), &[1, 2]);
        assert_eq!(hierarchy.label_name(0, 1), Some("method"));
    }

    #[test]
    fn rejects_leaf_with_two_parents() {
        let err = LabelHierarchy::from_paths(vec![
            vec!["background", "objective"],
            vec!["method", "objective"],
        ])
        .unwrap_err();
        assert!(matches!(err, crate::DataError::DataIntegrity(_)));
    }

    #[test]
    fn rejects_mixed_depths() {
        let err =
            LabelHierarchy::from_paths(vec![vec!["a", "b"], vec!["c"]]).unwrap_err();
        assert!(matches!(err, crate::DataError::DataIntegrity(_)));
    }

    #[test]
    fn persists_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hierarchy.json");
        let hierarchy = sections();
        hierarchy.save(&path).unwrap();
        assert_eq!(LabelHierarchy::load(&path).unwrap(), hierarchy);
    }
}
