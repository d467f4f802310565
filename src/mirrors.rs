use log::debug;

/// One download mirror. `url` always ends with a slash so tracked paths can
/// be appended directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateMirror {
    pub url: String,
    pub name: String,
    pub location: String,
}

impl UpdateMirror {
    pub fn new(url: &str, name: &str, location: &str) -> Self {
        let mut url = url.trim().to_owned();
        if !url.ends_with('/') {
            url.push('/');
        }
        Self {
            url,
            name: name.trim().to_owned(),
            location: location.trim().to_owned(),
        }
    }

    /// Build from a `url,name[,location]` field list.
    #[must_use]
    pub fn from_fields(fields: &[String]) -> Option<Self> {
        if fields.len() < 2 || fields[0].is_empty() {
            return None;
        }
        let location = fields.get(2).map(String::as_str).unwrap_or("");
        Some(Self::new(&fields[0], &fields[1], location))
    }
}

/// Ordered mirror set. Loaded once at initialization; only the user reorders
/// it afterwards. Failover bookkeeping (the current index) belongs to the
/// orchestrator.
#[derive(Debug, Clone, Default)]
pub struct MirrorList {
    mirrors: Vec<UpdateMirror>,
}

impl MirrorList {
    #[must_use]
    pub fn new(mirrors: Vec<UpdateMirror>) -> Self {
        Self { mirrors }
    }

    /// Rewrite the ordering as (user-prioritized mirrors, in the user's
    /// order) followed by the remaining defaults in their original order.
    /// Unknown names are ignored.
    pub fn apply_user_priority(&mut self, preferred_names: &[String]) {
        if preferred_names.is_empty() {
            return;
        }
        let mut remaining = std::mem::take(&mut self.mirrors);
        let mut ordered = Vec::with_capacity(remaining.len());
        for name in preferred_names {
            if let Some(pos) = remaining.iter().position(|m| &m.name == name) {
                ordered.push(remaining.remove(pos));
            } else {
                debug!("mirrors: unknown preferred mirror {name:?}");
            }
        }
        ordered.append(&mut remaining);
        self.mirrors = ordered;
    }

    /// Swap a mirror one slot towards the front; silent no-op out of range.
    pub fn move_up(&mut self, index: usize) {
        if index == 0 || index >= self.mirrors.len() {
            return;
        }
        self.mirrors.swap(index, index - 1);
    }

    /// Swap a mirror one slot towards the back; silent no-op out of range.
    pub fn move_down(&mut self, index: usize) {
        if self.mirrors.len() < 2 || index >= self.mirrors.len() - 1 {
            return;
        }
        self.mirrors.swap(index, index + 1);
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&UpdateMirror> {
        self.mirrors.get(index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.mirrors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mirrors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UpdateMirror> {
        self.mirrors.iter()
    }
}
