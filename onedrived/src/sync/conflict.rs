use std::collections::{HashMap, HashSet};

/// Splits `name` into stem and extension (with its dot). Dot-files such as
/// `.bashrc` have no extension.
pub fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(index) if index > 0 => name.split_at(index),
        _ => (name, ""),
    }
}

/// Name for the local copy kept when both replicas changed:
/// `A (host).txt`, then `A 1 (host).txt`, `A 2 (host).txt`, ...
pub fn keep_both_name(name: &str, host: &str, taken: impl Fn(&str) -> bool) -> String {
    let (stem, ext) = split_extension(name);
    let mut candidate = format!("{stem} ({host}){ext}");
    let mut counter = 1u32;
    while taken(&candidate) {
        candidate = format!("{stem} {counter} ({host}){ext}");
        counter += 1;
    }
    candidate
}

/// Tracks case-folded names seen in one directory listing and hands out
/// `"{stem} {n} (case conflict){ext}"` names for later collisions.
///
/// Generated names never reuse a name in `taken`, which holds every entry
/// of the listing as well as names handed out earlier.
#[derive(Debug, Default)]
pub struct CaseFolder {
    seen: HashMap<String, u32>,
    taken: HashSet<String>,
}

impl CaseFolder {
    /// A folder for a listing whose entries are all `names`, so a generated
    /// name cannot land on an entry that has not been admitted yet.
    pub fn with_existing<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            seen: HashMap::new(),
            taken: names.into_iter().map(str::to_lowercase).collect(),
        }
    }

    /// Registers `name`. Returns the name it must be renamed to when its
    /// case-folded form was already seen.
    pub fn admit(&mut self, name: &str) -> Option<String> {
        let folded = name.to_lowercase();
        let Some(&count) = self.seen.get(&folded) else {
            self.seen.insert(folded.clone(), 0);
            self.taken.insert(folded);
            return None;
        };
        let (stem, ext) = split_extension(name);
        let mut counter = count;
        let candidate = loop {
            counter += 1;
            let candidate = format!("{stem} {counter} (case conflict){ext}");
            if !self.taken.contains(&candidate.to_lowercase()) {
                break candidate;
            }
        };
        self.seen.insert(folded, counter);
        self.taken.insert(candidate.to_lowercase());
        Some(candidate)
    }
}
