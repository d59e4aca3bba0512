//! Group k-fold split: every group lands in exactly one fold.

use std::collections::BTreeMap;

use xray_core::{Error, Result};

use crate::dataset::SamplePair;

/// Assign sample indices to `n_splits` folds so no group spans two folds.
///
/// Groups are taken largest first (ties broken by descending name) and each
/// goes to the fold currently holding the fewest samples.
pub fn group_kfold(groups: &[String], n_splits: usize) -> Result<Vec<Vec<usize>>> {
    if n_splits < 2 {
        return Err(Error::Config(format!(
            "group k-fold needs at least 2 splits, got {n_splits}"
        )));
    }

    let mut members: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, g) in groups.iter().enumerate() {
        members.entry(g.as_str()).or_default().push(i);
    }
    if members.len() < n_splits {
        return Err(Error::Dataset(format!(
            "cannot split {} groups into {n_splits} folds",
            members.len()
        )));
    }

    let mut ordered: Vec<(&str, Vec<usize>)> = members.into_iter().collect();
    ordered.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| b.0.cmp(a.0)));

    let mut folds: Vec<Vec<usize>> = vec![Vec::new(); n_splits];
    for (_, indices) in ordered {
        let lightest = folds
            .iter()
            .enumerate()
            .min_by_key(|(i, f)| (f.len(), *i))
            .map(|(i, _)| i)
            .unwrap_or(0);
        folds[lightest].extend(indices);
    }
    for fold in &mut folds {
        fold.sort_unstable();
    }

    Ok(folds)
}

/// Train/validation split of image/annotation pairs grouped by directory
#[derive(Debug, Clone)]
pub struct FoldSplit {
    pub train: Vec<SamplePair>,
    pub valid: Vec<SamplePair>,
}

impl FoldSplit {
    pub fn new(pairs: &[SamplePair], n_splits: usize, valid_fold: usize) -> Result<Self> {
        if valid_fold >= n_splits {
            return Err(Error::Config(format!(
                "validation fold {valid_fold} out of range for {n_splits} splits"
            )));
        }

        let groups: Vec<String> = pairs.iter().map(SamplePair::group).collect();
        let folds = group_kfold(&groups, n_splits)?;

        let mut split = Self {
            train: Vec::new(),
            valid: Vec::new(),
        };
        for (k, fold) in folds.iter().enumerate() {
            let target = if k == valid_fold {
                &mut split.valid
            } else {
                &mut split.train
            };
            target.extend(fold.iter().map(|&i| pairs[i].clone()));
        }

        tracing::info!(
            train = split.train.len(),
            valid = split.valid.len(),
            valid_fold,
            n_splits,
            "Split samples by group"
        );
        Ok(split)
    }
}
