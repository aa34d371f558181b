use crate::source::FileCandidate;

/// Inclusion rules applied in order: extension allow-list, size cap, file count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRules {
    /// Lowercase suffixes including the leading dot (`.py`).
    pub extensions: Vec<String>,
    pub max_file_size: u64,
    pub max_files: usize,
    /// Character budget for the content of one review batch.
    pub max_batch_chars: usize,
}

impl FilterRules {
    pub fn new(
        extensions: Vec<String>,
        max_file_size: u64,
        max_files: usize,
        max_batch_chars: usize,
    ) -> Self {
        Self {
            extensions,
            max_file_size,
            max_files,
            max_batch_chars,
        }
    }

    /// Largest file that can be reviewed: no file may exceed the size cap or
    /// overflow a batch on its own.
    pub fn per_file_limit(&self) -> u64 {
        self.max_file_size.min(self.max_batch_chars as u64)
    }

    pub fn matches_extension(&self, path: &str) -> bool {
        let name = path.rsplit('/').next().unwrap_or(path).to_ascii_lowercase();
        self.extensions.iter().any(|ext| name.ends_with(ext.as_str()))
    }

    fn size_violation(&self, candidate: &FileCandidate) -> Option<String> {
        let limit = self.per_file_limit();
        match candidate.size {
            Some(size) if size > limit => Some(format!(
                "file size {size} bytes exceeds the {limit} byte limit"
            )),
            _ => None,
        }
    }
}

/// Result of running enumerated candidates through [`FilterRules`].
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Files to fetch and review, in enumeration order.
    pub admitted: Vec<FileCandidate>,
    /// Files that matched the allow-list but were too large, with the reason.
    pub skipped: Vec<(FileCandidate, String)>,
    /// Count of candidates dropped by the extension allow-list.
    pub filtered_out: usize,
}

/// What happened to a single offered candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Skipped(String),
    FilteredOut,
    /// The file-count limit was already reached; the candidate was ignored.
    Full,
}

/// Incremental selector so callers can stop pulling from a lazy enumerator as
/// soon as the file-count limit is reached.
#[derive(Debug)]
pub struct Selector<'a> {
    rules: &'a FilterRules,
    selection: Selection,
}

impl<'a> Selector<'a> {
    pub fn new(rules: &'a FilterRules) -> Self {
        Self {
            rules,
            selection: Selection::default(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.selection.admitted.len() >= self.rules.max_files
    }

    pub fn offer(&mut self, candidate: FileCandidate) -> Admission {
        if self.is_full() {
            return Admission::Full;
        }
        if !self.rules.matches_extension(&candidate.path) {
            self.selection.filtered_out += 1;
            return Admission::FilteredOut;
        }
        if let Some(reason) = self.rules.size_violation(&candidate) {
            self.selection.skipped.push((candidate, reason.clone()));
            return Admission::Skipped(reason);
        }
        self.selection.admitted.push(candidate);
        Admission::Admitted
    }

    pub fn finish(self) -> Selection {
        self.selection
    }
}

/// Run an already materialised candidate list through the rules.
pub fn select<I>(rules: &FilterRules, candidates: I) -> Selection
where
    I: IntoIterator<Item = FileCandidate>,
{
    let mut selector = Selector::new(rules);
    for candidate in candidates {
        if selector.is_full() {
            break;
        }
        selector.offer(candidate);
    }
    selector.finish()
}

/// Files sent to the model in one request. Their content is concatenated
/// into a single prompt once fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewBatch {
    pub files: Vec<FileCandidate>,
}

impl ReviewBatch {
    /// Known size of the batch; files of unknown size count as zero.
    pub fn estimated_chars(&self) -> u64 {
        self.files.iter().filter_map(|file| file.size).sum()
    }
}

/// Greedily group admitted files, preserving order, so that no batch exceeds
/// `budget` characters of known content.
///
/// Sizes that are unknown here count as zero; the fetched content is packed
/// again with [`pack`] before it reaches the model.
pub fn batch(admitted: Vec<FileCandidate>, budget: usize) -> Vec<ReviewBatch> {
    pack(admitted, budget, |file| file.size.unwrap_or(0))
        .into_iter()
        .map(|files| ReviewBatch { files })
        .collect()
}

/// Split `items` in order into groups whose total weight stays within
/// `budget`. A group is closed when the next item would overflow it; an item
/// heavier than the budget ends up alone.
pub fn pack<T, F>(items: Vec<T>, budget: usize, weight: F) -> Vec<Vec<T>>
where
    F: Fn(&T) -> u64,
{
    let budget = budget as u64;
    let mut groups = Vec::new();
    let mut current: Vec<T> = Vec::new();
    let mut used = 0u64;

    for item in items {
        let size = weight(&item);
        if !current.is_empty() && used + size > budget {
            groups.push(std::mem::take(&mut current));
            used = 0;
        }
        used += size;
        current.push(item);
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceKind;
    use proptest::prelude::*;

    fn candidate(ordinal: usize, path: &str, size: Option<u64>) -> FileCandidate {
        FileCandidate {
            ordinal,
            path: path.to_string(),
            size,
            kind: SourceKind::Local,
            diff: None,
        }
    }

    fn rules(max_file_size: u64, max_files: usize, max_batch_chars: usize) -> FilterRules {
        FilterRules::new(
            vec![".py".into(), ".rs".into()],
            max_file_size,
            max_files,
            max_batch_chars,
        )
    }

    #[test]
    fn applies_rules_in_order() {
        let selection = select(
            &rules(100, 2, 1_000),
            vec![
                candidate(0, "README.md", Some(10)),
                candidate(1, "big.py", Some(500)),
                candidate(2, "src/a.py", Some(10)),
                candidate(3, "src/B.RS", Some(20)),
                candidate(4, "src/c.py", Some(30)),
            ],
        );
        let admitted: Vec<_> = selection.admitted.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(admitted, vec!["src/a.py", "src/B.RS"]);
        assert_eq!(selection.skipped.len(), 1);
        assert_eq!(selection.skipped[0].0.path, "big.py");
        assert!(selection.skipped[0].1.contains("exceeds"));
        assert_eq!(selection.filtered_out, 1);
    }

    #[test]
    fn five_qualifying_files_truncate_to_max_files() {
        let files = (0..5).map(|i| candidate(i, &format!("f{i}.py"), Some(1)));
        let selection = select(&rules(100, 2, 1_000), files);
        assert_eq!(selection.admitted.len(), 2);
        assert_eq!(selection.admitted[1].path, "f1.py");
    }

    #[test]
    fn selector_reports_full() {
        let rules = rules(100, 1, 1_000);
        let mut selector = Selector::new(&rules);
        assert_eq!(selector.offer(candidate(0, "a.py", Some(1))), Admission::Admitted);
        assert!(selector.is_full());
        assert_eq!(selector.offer(candidate(1, "b.py", Some(1))), Admission::Full);
        assert_eq!(selector.finish().admitted.len(), 1);
    }

    #[test]
    fn per_file_limit_honours_batch_budget() {
        let rules = rules(50_000, 10, 1_000);
        assert_eq!(rules.per_file_limit(), 1_000);
        let mut selector = Selector::new(&rules);
        assert!(matches!(
            selector.offer(candidate(0, "a.py", Some(1_001))),
            Admission::Skipped(_)
        ));
    }

    #[test]
    fn unknown_sizes_are_admitted() {
        let selection = select(&rules(10, 5, 10), vec![candidate(0, "pr.py", None)]);
        assert_eq!(selection.admitted.len(), 1);
    }

    #[test]
    fn batches_split_on_budget() {
        let files = vec![
            candidate(0, "a.py", Some(40)),
            candidate(1, "b.py", Some(50)),
            candidate(2, "c.py", Some(20)),
            candidate(3, "d.py", None),
        ];
        let batches = batch(files, 100);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].files.len(), 2);
        assert_eq!(batches[1].estimated_chars(), 20);
        assert_eq!(batches[1].files[1].path, "d.py");
    }

    #[test]
    fn pack_keeps_order_and_isolates_oversized_items() {
        let groups = pack(vec![60u64, 60, 30, 150, 10], 100, |n| *n);
        assert_eq!(groups, vec![vec![60], vec![60, 30], vec![150], vec![10]]);
    }

    #[test]
    fn empty_input_yields_no_batches() {
        assert!(batch(Vec::new(), 100).is_empty());
    }

    fn candidates_strategy() -> impl Strategy<Value = Vec<FileCandidate>> {
        proptest::collection::vec(
            (
                prop_oneof![Just("py"), Just("rs"), Just("md"), Just("PY")],
                proptest::option::weighted(0.9, 0u64..4_000),
            ),
            0..40,
        )
        .prop_map(|entries| {
            entries
                .into_iter()
                .enumerate()
                .map(|(idx, (ext, size))| candidate(idx, &format!("dir/file{idx}.{ext}"), size))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn never_admits_files_above_size_cap(
            files in candidates_strategy(),
            max_file_size in 1u64..3_000,
            max_files in 1usize..30,
            budget in 1usize..5_000,
        ) {
            let rules = rules(max_file_size, max_files, budget);
            let selection = select(&rules, files.clone());

            prop_assert!(selection.admitted.len() <= max_files);
            for file in &selection.admitted {
                prop_assert!(file.size.unwrap_or(0) <= max_file_size);
                prop_assert!(rules.matches_extension(&file.path));
            }
            let ordinals: Vec<_> = selection.admitted.iter().map(|f| f.ordinal).collect();
            let mut sorted = ordinals.clone();
            sorted.sort_unstable();
            prop_assert_eq!(ordinals, sorted);

            let batches = batch(selection.admitted.clone(), budget);
            for batch in &batches {
                prop_assert!(!batch.files.is_empty());
                prop_assert!(batch.estimated_chars() <= budget as u64);
            }
            let flattened: Vec<_> = batches.into_iter().flat_map(|b| b.files).collect();
            prop_assert_eq!(flattened, selection.admitted);
        }
    }
}
