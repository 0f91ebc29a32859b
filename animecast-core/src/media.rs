use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sqlite::{open_configured, open_flags, to_utc};

const MEDIA_SCHEMA: &str = include_str!("../../sql/media.sql");

pub const VIDEO_MIME: &str = "video/mp4";

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("failed to open media database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to create media database directory {path}: {source}")]
    CreateDir {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on media database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("media database path not configured")]
    MissingStore,
    #[error("episode {0} not found")]
    EpisodeNotFound(i64),
    #[error("invalid media type: {0}")]
    InvalidMediaType(String),
}

pub type MediaResult<T> = Result<T, MediaError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Video,
    Other,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Video => "video",
            MediaType::Other => "other",
        }
    }
}

impl std::str::FromStr for MediaType {
    type Err = MediaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "video" => Ok(MediaType::Video),
            "other" => Ok(MediaType::Other),
            other => Err(MediaError::InvalidMediaType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: i64,
    pub anime_id: i64,
    pub season_number: u32,
    pub episode_number: u32,
    pub title: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewEpisode {
    pub anime_id: i64,
    pub season_number: u32,
    pub episode_number: u32,
    pub title: Option<String>,
}

impl NewEpisode {
    pub fn new(anime_id: i64, episode_number: u32) -> Self {
        Self {
            anime_id,
            season_number: 1,
            episode_number,
            title: None,
        }
    }

    pub fn season(mut self, season_number: u32) -> Self {
        self.season_number = season_number;
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeMedia {
    pub id: i64,
    pub episode_id: i64,
    pub media_type: MediaType,
    pub quality: Option<String>,
    pub path: String,
    pub mime: Option<String>,
    pub size: Option<u64>,
    /// Seconds.
    pub duration: Option<u64>,
    pub language: Option<String>,
    pub is_primary: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Values written for one encoded rendition. Rows are matched on
/// episode, type, quality and language; everything else is overwritten.
#[derive(Debug, Clone, PartialEq)]
pub struct RenditionRecord {
    pub episode_id: i64,
    pub media_type: MediaType,
    pub quality: String,
    pub language: Option<String>,
    pub path: String,
    pub mime: String,
    pub size: Option<u64>,
    pub duration: Option<u64>,
    pub is_primary: bool,
}

impl RenditionRecord {
    pub fn video(episode_id: i64, quality: &str, path: &str) -> Self {
        Self {
            episode_id,
            media_type: MediaType::Video,
            quality: quality.to_string(),
            language: None,
            path: path.to_string(),
            mime: VIDEO_MIME.to_string(),
            size: None,
            duration: None,
            is_primary: false,
        }
    }

    /// Empty language tags are stored as NULL.
    pub fn language(mut self, language: Option<&str>) -> Self {
        self.language = language
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(str::to_string);
        self
    }
}

#[derive(Debug, Clone)]
pub struct SqliteMediaStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteMediaStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteMediaStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> MediaResult<SqliteMediaStore> {
        let path = self.path.ok_or(MediaError::MissingStore)?;
        Ok(SqliteMediaStore {
            path,
            flags: open_flags(self.read_only, self.create_if_missing),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteMediaStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteMediaStore {
    pub fn builder() -> SqliteMediaStoreBuilder {
        SqliteMediaStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> MediaResult<Self> {
        SqliteMediaStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> MediaResult<Connection> {
        open_configured(&self.path, self.flags).map_err(|source| MediaError::Open {
            source,
            path: self.path.clone(),
        })
    }

    pub fn initialize(&self) -> MediaResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| MediaError::CreateDir {
                source,
                path: parent.to_path_buf(),
            })?;
        }
        let conn = self.open()?;
        conn.execute_batch(MEDIA_SCHEMA)?;
        Ok(())
    }

    pub fn upsert_episode(&self, episode: &NewEpisode) -> MediaResult<Episode> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO episodes (anime_id, season_number, episode_number, title)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(anime_id, season_number, episode_number)
             DO UPDATE SET title = excluded.title, updated_at = CURRENT_TIMESTAMP",
            params![
                episode.anime_id,
                episode.season_number,
                episode.episode_number,
                episode.title
            ],
        )?;
        let stored = conn.query_row(
            "SELECT id, anime_id, season_number, episode_number, title, created_at, updated_at
             FROM episodes WHERE anime_id = ?1 AND season_number = ?2 AND episode_number = ?3",
            params![
                episode.anime_id,
                episode.season_number,
                episode.episode_number
            ],
            map_episode,
        )?;
        Ok(stored)
    }

    pub fn fetch_episode(&self, episode_id: i64) -> MediaResult<Option<Episode>> {
        let conn = self.open()?;
        let episode = conn
            .query_row(
                "SELECT id, anime_id, season_number, episode_number, title, created_at, updated_at
                 FROM episodes WHERE id = ?1",
                [episode_id],
                map_episode,
            )
            .optional()?;
        Ok(episode)
    }

    /// Drops the primary flag from every video row of the episode.
    pub fn clear_primary_video(&self, episode_id: i64) -> MediaResult<usize> {
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE episode_media SET is_primary = 0, updated_at = CURRENT_TIMESTAMP
             WHERE episode_id = ?1 AND type = 'video' AND is_primary = 1",
            [episode_id],
        )?;
        Ok(changed)
    }

    pub fn upsert_rendition(&self, record: &RenditionRecord) -> MediaResult<EpisodeMedia> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM episodes WHERE id = ?1)",
            [record.episode_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(MediaError::EpisodeNotFound(record.episode_id));
        }
        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM episode_media
                 WHERE episode_id = ?1 AND type = ?2 AND quality IS ?3 AND language IS ?4",
                params![
                    record.episode_id,
                    record.media_type.as_str(),
                    record.quality,
                    record.language
                ],
                |row| row.get(0),
            )
            .optional()?;
        let size = record.size.map(|value| value as i64);
        let duration = record.duration.map(|value| value as i64);
        let id = match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE episode_media SET path = ?2, mime = ?3, size = ?4, duration = ?5,
                         is_primary = ?6, updated_at = CURRENT_TIMESTAMP
                     WHERE id = ?1",
                    params![
                        id,
                        record.path,
                        record.mime,
                        size,
                        duration,
                        record.is_primary
                    ],
                )?;
                id
            }
            None => {
                tx.execute(
                    "INSERT INTO episode_media
                         (episode_id, type, quality, path, mime, size, duration, language, is_primary)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        record.episode_id,
                        record.media_type.as_str(),
                        record.quality,
                        record.path,
                        record.mime,
                        size,
                        duration,
                        record.language,
                        record.is_primary
                    ],
                )?;
                tx.last_insert_rowid()
            }
        };
        let stored = tx.query_row(
            "SELECT id, episode_id, type, quality, path, mime, size, duration, language,
                    is_primary, created_at, updated_at
             FROM episode_media WHERE id = ?1",
            [id],
            map_media,
        )?;
        tx.commit()?;
        Ok(stored)
    }

    pub fn list_media(&self, episode_id: i64) -> MediaResult<Vec<EpisodeMedia>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, episode_id, type, quality, path, mime, size, duration, language,
                    is_primary, created_at, updated_at
             FROM episode_media WHERE episode_id = ?1
             ORDER BY is_primary DESC, id ASC",
        )?;
        let rows = stmt.query_map([episode_id], map_media)?;
        let mut media = Vec::new();
        for row in rows {
            media.push(row?);
        }
        Ok(media)
    }
}

fn map_episode(row: &Row<'_>) -> rusqlite::Result<Episode> {
    Ok(Episode {
        id: row.get(0)?,
        anime_id: row.get(1)?,
        season_number: row.get(2)?,
        episode_number: row.get(3)?,
        title: row.get(4)?,
        created_at: to_utc(row.get::<_, Option<NaiveDateTime>>(5)?),
        updated_at: to_utc(row.get::<_, Option<NaiveDateTime>>(6)?),
    })
}

fn map_media(row: &Row<'_>) -> rusqlite::Result<EpisodeMedia> {
    let raw_type: String = row.get(2)?;
    let media_type = raw_type.parse::<MediaType>().unwrap_or(MediaType::Other);
    Ok(EpisodeMedia {
        id: row.get(0)?,
        episode_id: row.get(1)?,
        media_type,
        quality: row.get(3)?,
        path: row.get(4)?,
        mime: row.get(5)?,
        size: row.get::<_, Option<i64>>(6)?.map(|value| value.max(0) as u64),
        duration: row.get::<_, Option<i64>>(7)?.map(|value| value.max(0) as u64),
        language: row.get(8)?,
        is_primary: row.get(9)?,
        created_at: to_utc(row.get::<_, Option<NaiveDateTime>>(10)?),
        updated_at: to_utc(row.get::<_, Option<NaiveDateTime>>(11)?),
    })
}
