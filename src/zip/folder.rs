//! Folder tree view over a flat catalog.

use super::entry::Entry;

/// One directory level of an archive's contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Folder {
    pub name: String,
    /// Files directly inside this folder
    pub entries: Vec<Entry>,
    pub subfolders: Vec<Folder>,
    /// Total compressed size of everything below this folder
    pub size: u64,
}

impl Folder {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Build the tree rooted at "/" from catalog entries.
    ///
    /// Directory entries only shape the tree through the paths of the files
    /// they contain; empty directories are kept as empty folders.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a Entry>) -> Self {
        let mut root = Folder::named("/");

        for entry in entries {
            let mut components: Vec<&str> =
                entry.path.split('/').filter(|c| !c.is_empty()).collect();
            let file = if entry.is_directory() {
                None
            } else {
                components.pop()
            };

            let mut folder = &mut root;
            for component in components {
                folder = folder.subfolder_mut(component);
            }
            if file.is_some() {
                folder.entries.push(entry.clone());
            }
        }

        root.calc_size();
        root
    }

    fn subfolder_mut(&mut self, name: &str) -> &mut Folder {
        let index = match self.subfolders.iter().position(|f| f.name == name) {
            Some(index) => index,
            None => {
                self.subfolders.push(Folder::named(name));
                self.subfolders.len() - 1
            }
        };
        &mut self.subfolders[index]
    }

    fn calc_size(&mut self) -> u64 {
        let entries: u64 = self.entries.iter().map(|e| e.compressed_size).sum();
        let subfolders: u64 = self.subfolders.iter_mut().map(|f| f.calc_size()).sum();
        self.size = entries + subfolders;
        self.size
    }

    /// Find a nested folder by slash-separated path
    pub fn find(&self, path: &str) -> Option<&Folder> {
        path.split('/')
            .filter(|c| !c.is_empty())
            .try_fold(self, |folder, name| {
                folder.subfolders.iter().find(|f| f.name == name)
            })
    }

    /// Number of files in this folder and all subfolders
    pub fn file_count(&self) -> usize {
        self.entries.len() + self.subfolders.iter().map(Folder::file_count).sum::<usize>()
    }
}
