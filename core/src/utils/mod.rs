//! Notebook utilities: file system helpers and widgets.

pub mod fs;
pub mod widgets;

use std::path::Path;

pub use fs::{FileInfo, FileSystemUtils};
pub use widgets::{Widget, WidgetKind, Widgets};

use crate::error::Result;

#[derive(Debug)]
pub struct NotebookUtils {
    fs: FileSystemUtils,
    widgets: Widgets,
}

impl NotebookUtils {
    pub fn try_new(dbfs_root: &Path) -> Result<Self> {
        Ok(Self {
            fs: FileSystemUtils::try_new(dbfs_root)?,
            widgets: Widgets::new(),
        })
    }

    pub fn fs(&self) -> &FileSystemUtils {
        &self.fs
    }

    pub fn widgets(&self) -> &Widgets {
        &self.widgets
    }
}
