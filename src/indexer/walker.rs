use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{Error, Result};

/// A knowledge-base document: one markdown file.
#[derive(Debug, Clone)]
pub struct Document {
    /// Base file name, used as the chunk `source`.
    pub name: String,
    pub path: PathBuf,
    pub text: String,
}

fn is_markdown(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("md"))
        .unwrap_or(false)
}

/// Markdown files directly inside `dir`, sorted by file name.
pub fn list_markdown_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::KnowledgeBase(format!(
            "knowledge base directory not found: {}",
            dir.display()
        )));
    }

    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| is_markdown(path))
        .collect();
    files.sort();
    Ok(files)
}

pub fn load_documents(dir: &Path) -> Result<Vec<Document>> {
    list_markdown_files(dir)?
        .into_iter()
        .map(|path| {
            let text = std::fs::read_to_string(&path).map_err(|e| {
                Error::KnowledgeBase(format!("Failed to read {}: {}", path.display(), e))
            })?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            Ok(Document { name, path, text })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_top_level_markdown_is_loaded() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("b.md"), "bravo").unwrap();
        std::fs::write(tmp.path().join("a.MD"), "alpha").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "skip").unwrap();
        std::fs::create_dir(tmp.path().join("nested")).unwrap();
        std::fs::write(tmp.path().join("nested/c.md"), "skip").unwrap();

        let docs = load_documents(tmp.path()).unwrap();
        let names: Vec<&str> = docs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["a.MD", "b.md"]);
        assert_eq!(docs[1].text, "bravo");
    }

    #[test]
    fn test_missing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_documents(&tmp.path().join("missing")),
            Err(Error::KnowledgeBase(_))
        ));
    }
}
