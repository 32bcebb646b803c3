/// Project operations on the card store: `_project.json` lifecycle, lanes and
/// prefixes.
use std::collections::HashSet;
use std::io::ErrorKind;

use super::local::CardStore;
use super::lock::LockKey;
use super::{validation, StorageError};
use crate::slug::{generate_prefix, is_valid_prefix, is_valid_segment, slugify};
use crate::types::*;

impl CardStore {
    /// All projects, sorted by slug. Directories with a missing or broken
    /// `_project.json` are skipped.
    pub async fn list_projects(
        &self,
        include_archived: bool,
    ) -> Result<Vec<Project>, StorageError> {
        let mut projects = Vec::new();
        for slug in self.project_slugs().await? {
            match self.read_project_config(&slug).await {
                Ok(config) if include_archived || !config.archived => {
                    projects.push(Project { slug, config });
                }
                Ok(_) => {}
                Err(StorageError::ProjectNotFound(_)) => {}
                Err(e) => log::warn!("[markban.store.projects] Skipping {}: {}", slug, e),
            }
        }
        Ok(projects)
    }

    pub async fn get_project(&self, slug: &str) -> Result<Project, StorageError> {
        let config = self.read_project_config(slug).await?;
        Ok(Project {
            slug: slug.to_string(),
            config,
        })
    }

    pub async fn create_project(&self, input: NewProject) -> Result<Project, StorageError> {
        let name = input.name.trim().to_string();
        if name.is_empty() {
            return Err(validation("name is required"));
        }
        let slug = slugify(&name);
        if slug.is_empty() {
            return Err(validation(format!("cannot derive a slug from {:?}", name)));
        }
        let lanes = input.lanes.unwrap_or_else(default_lanes);
        if let Some(bad) = lanes.keys().find(|lane| !is_valid_segment(lane)) {
            return Err(validation(format!("invalid lane: {:?}", bad)));
        }

        let _guard = self.locks().acquire(LockKey::project_config(&slug)).await;
        if tokio::fs::try_exists(self.project_config_path(&slug)).await? {
            return Err(StorageError::ProjectExists(slug));
        }

        let taken = self.taken_prefixes().await?;
        let prefix = match input.prefix {
            Some(prefix) => {
                let prefix = prefix.trim().to_ascii_uppercase();
                if !is_valid_prefix(&prefix) {
                    return Err(validation(format!(
                        "prefix must be 2-4 uppercase letters: {:?}",
                        prefix
                    )));
                }
                if taken.contains(&prefix) {
                    return Err(StorageError::PrefixTaken(prefix));
                }
                Some(prefix)
            }
            None => generate_prefix(&name, &taken),
        };

        let now = now_iso();
        let config = ProjectConfig {
            name,
            description: input.description.filter(|d| !d.trim().is_empty()),
            created: now.clone(),
            updated: now,
            archived: false,
            lanes,
            prefix,
            next_card_number: Some(1),
            extra: Default::default(),
        };

        for lane in config.lanes.keys() {
            tokio::fs::create_dir_all(self.lane_dir(&slug, lane)).await?;
        }
        self.write_project_config(&slug, &config).await?;
        log::info!("[markban.store.project] Created project {}", slug);
        Ok(Project { slug, config })
    }

    pub async fn update_project(
        &self,
        slug: &str,
        patch: ProjectPatch,
    ) -> Result<Project, StorageError> {
        let _guard = self.locks().acquire(LockKey::project_config(slug)).await;
        let mut config = self.read_project_config(slug).await?;

        if let Some(name) = patch.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(validation("name must not be empty"));
            }
            config.name = name.to_string();
        }
        if let Some(description) = patch.description {
            config.description = description;
        }
        if let Some(archived) = patch.archived {
            config.archived = archived;
        }
        if let Some(lanes) = patch.lanes {
            if let Some(bad) = lanes.keys().find(|lane| !is_valid_segment(lane)) {
                return Err(validation(format!("invalid lane: {:?}", bad)));
            }
            for lane in lanes.keys() {
                tokio::fs::create_dir_all(self.lane_dir(slug, lane)).await?;
            }
            config.lanes = lanes;
        }
        config.updated = timestamp_after(&config.updated);

        self.write_project_config(slug, &config).await?;
        log::info!("[markban.store.project] Updated project {}", slug);
        Ok(Project {
            slug: slug.to_string(),
            config,
        })
    }

    /// Soft delete: the project stays on disk, hidden from default listings.
    pub async fn archive_project(&self, slug: &str) -> Result<Project, StorageError> {
        self.update_project(
            slug,
            ProjectPatch {
                archived: Some(true),
                ..Default::default()
            },
        )
        .await
    }

    /// Remove the project directory and everything in it.
    pub async fn delete_project_permanently(&self, slug: &str) -> Result<(), StorageError> {
        let _guard = self.locks().acquire(LockKey::project_config(slug)).await;
        self.read_project_config(slug).await?;
        tokio::fs::remove_dir_all(self.project_dir(slug)).await?;
        log::warn!("[markban.store.project] Permanently deleted project {}", slug);
        Ok(())
    }

    async fn project_slugs(&self) -> Result<Vec<String>, StorageError> {
        let mut entries = match tokio::fs::read_dir(self.root()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut slugs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || name.starts_with('_') {
                continue;
            }
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                slugs.push(name);
            }
        }
        slugs.sort();
        Ok(slugs)
    }

    /// Prefixes of every project, archived ones included.
    async fn taken_prefixes(&self) -> Result<HashSet<String>, StorageError> {
        Ok(self
            .list_projects(true)
            .await?
            .into_iter()
            .filter_map(|p| p.config.prefix)
            .collect())
    }
}
