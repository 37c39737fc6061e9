use std::path::{Path, PathBuf};
use std::sync::Arc;
use anyhow::{bail, Context, Result};
use log::{debug, info};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;
use crate::collaborators::Narrator;
use crate::error::PipelineResult;
use crate::job::{AuxiliaryAsset, Job, WorkItem};
use crate::progress::ProgressSegment;
use crate::render::{ProgressSink, SilentProgress};

/// Owner recorded on manifests generated from the command line
pub const LOCAL_OWNER: &str = "local-cli-user";

/// Payload key for the lesson snapshot forwarded to the recorder
pub const LESSON_KEY: &str = "lesson";

/// Payload key for IDE presentation properties
pub const IDE_PROPS_KEY: &str = "codeVideoIDEProps";

/// Prefix of work items that carry narration text
const SPEAK_PREFIX: &str = "author-speak";

const NARRATION_LABEL: &str = "Generating audio for speaking actions...";

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("project is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("invalid action at index {index}: name and value must both be non-empty")]
    InvalidAction { index: usize },

    #[error("lesson {index} of the course is not a valid lesson: {reason}")]
    InvalidLesson { index: usize, reason: String },

    #[error("unable to determine project type: expected a course, a lesson or a list of actions")]
    Unrecognized,
}

/// One lesson: its actions drive narration, the whole object is forwarded as-is
#[derive(Debug, Clone, PartialEq)]
pub struct Lesson {
    pub title: String,
    pub actions: Vec<WorkItem>,
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Course {
    pub title: String,
    pub lessons: Vec<Lesson>,
}

/// What a project document describes
#[derive(Debug, Clone, PartialEq)]
pub enum Project {
    Course(Course),
    Lesson(Lesson),
    Actions(Vec<WorkItem>),
}

impl Project {
    pub fn kind(&self) -> &'static str {
        match self {
            Project::Course(_) => "Course",
            Project::Lesson(_) => "Lesson",
            Project::Actions(_) => "Actions",
        }
    }
}

fn title_of(map: &Map<String, Value>) -> String {
    map.get("title").and_then(Value::as_str).unwrap_or_default().to_string()
}

fn parse_actions(value: &Value) -> std::result::Result<Vec<WorkItem>, serde_json::Error> {
    serde_json::from_value(value.clone())
}

fn lesson_from(value: &Value) -> std::result::Result<Lesson, String> {
    let map = value.as_object().ok_or_else(|| "not an object".to_string())?;
    let actions = match map.get("actions") {
        Some(actions) => parse_actions(actions).map_err(|e| e.to_string())?,
        None => Vec::new(),
    };
    Ok(Lesson {
        title: title_of(map),
        actions,
        raw: value.clone(),
    })
}

fn non_empty_array<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Vec<Value>> {
    map.get(key).and_then(Value::as_array).filter(|items| !items.is_empty())
}

/// Classify a project document in one pass.
///
/// Precedence: an object with non-empty `lessons` is a course, otherwise an object with
/// non-empty `actions` is a lesson, otherwise a non-empty array of valid actions.
pub fn detect_project(json: &str) -> std::result::Result<Project, ProjectError> {
    let value: Value = serde_json::from_str(json)?;

    match &value {
        Value::Object(map) => {
            if let Some(lessons) = non_empty_array(map, "lessons") {
                let lessons = lessons
                    .iter()
                    .enumerate()
                    .map(|(index, v)| lesson_from(v).map_err(|reason| ProjectError::InvalidLesson { index, reason }))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                return Ok(Project::Course(Course {
                    title: title_of(map),
                    lessons,
                }));
            }
            if non_empty_array(map, "actions").is_some() {
                let lesson = lesson_from(&value).map_err(|_| ProjectError::Unrecognized)?;
                return Ok(Project::Lesson(lesson));
            }
            Err(ProjectError::Unrecognized)
        }
        Value::Array(items) if !items.is_empty() => {
            let actions = parse_actions(&value)?;
            if let Some(index) = actions.iter().position(|a| !a.is_valid()) {
                return Err(ProjectError::InvalidAction { index });
            }
            Ok(Project::Actions(actions))
        }
        _ => Err(ProjectError::Unrecognized),
    }
}

/// Load IDE presentation properties. `theme` must be `light` or `dark` and
/// `defaultLanguage` must be set; everything else is forwarded untouched.
pub fn load_ide_props(path: &Path) -> Result<Value> {
    if !path.exists() {
        bail!("config file not found: {}", path.display());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let props: Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config JSON: {}", path.display()))?;

    let theme = props.get("theme").and_then(Value::as_str).unwrap_or_default();
    if theme != "light" && theme != "dark" {
        bail!("theme must be 'light' or 'dark', got: {}", theme);
    }
    let language = props.get("defaultLanguage").and_then(Value::as_str).unwrap_or_default();
    if language.is_empty() {
        bail!("defaultLanguage is required");
    }
    Ok(props)
}

/// `<dir>/<stem>-<n>.<ext>` for the n-th lesson of a course rendered to `output`
pub fn numbered_output(output: &Path, n: usize) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "CodeVideo".to_string());
    let file_name = match output.extension() {
        Some(ext) => format!("{}-{}.{}", stem, n, ext.to_string_lossy()),
        None => format!("{}-{}", stem, n),
    };
    output.with_file_name(file_name)
}

/// Turns projects into job records with fresh ids
pub struct Generator {
    pub environment: String,
    pub owner_id: String,
    pub ide_props: Option<Value>,
    narrator: Option<Arc<dyn Narrator>>,
    progress: Arc<dyn ProgressSink>,
}

impl Generator {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            owner_id: LOCAL_OWNER.to_string(),
            ide_props: None,
            narrator: None,
            progress: Arc::new(SilentProgress),
        }
    }

    pub fn with_ide_props(mut self, props: Value) -> Self {
        self.ide_props = Some(props);
        self
    }

    pub fn with_narrator(mut self, narrator: Arc<dyn Narrator>) -> Self {
        self.narrator = Some(narrator);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// One record per lesson for a course, one record otherwise
    pub async fn generate(&self, project: &Project) -> PipelineResult<Vec<Job>> {
        match project {
            Project::Course(course) => self.from_course(course).await,
            Project::Lesson(lesson) => Ok(vec![self.from_lesson(lesson).await?]),
            Project::Actions(actions) => Ok(vec![self.from_actions(actions).await?]),
        }
    }

    pub async fn from_actions(&self, actions: &[WorkItem]) -> PipelineResult<Job> {
        let mut job = self.base_job();
        info!("Job {}: generated from {} action(s)", job.id, actions.len());
        job.auxiliary_assets = self.narrate(actions).await?;
        job.work_items = actions.iter().map(WorkItem::to_value).collect();
        Ok(job)
    }

    pub async fn from_lesson(&self, lesson: &Lesson) -> PipelineResult<Job> {
        let mut job = self.base_job();
        info!("Job {}: generated from lesson '{}'", job.id, lesson.title);
        job.auxiliary_assets = self.narrate(&lesson.actions).await?;
        job.payload.insert(LESSON_KEY.to_string(), lesson.raw.clone());
        Ok(job)
    }

    pub async fn from_course(&self, course: &Course) -> PipelineResult<Vec<Job>> {
        let mut jobs = Vec::with_capacity(course.lessons.len());
        for lesson in &course.lessons {
            jobs.push(self.from_lesson(lesson).await?);
        }
        Ok(jobs)
    }

    fn base_job(&self) -> Job {
        let mut job = Job::new(Uuid::new_v4().to_string());
        job.environment = self.environment.clone();
        job.owner_id = self.owner_id.clone();
        if let Some(props) = &self.ide_props {
            job.payload.insert(IDE_PROPS_KEY.to_string(), props.clone());
        }
        job
    }

    async fn narrate(&self, actions: &[WorkItem]) -> PipelineResult<Vec<AuxiliaryAsset>> {
        let Some(narrator) = &self.narrator else {
            return Ok(Vec::new());
        };

        self.progress.report(0.0, NARRATION_LABEL);
        let mut assets = Vec::new();
        for (i, action) in actions.iter().enumerate() {
            if action.name.starts_with(SPEAK_PREFIX) {
                debug!("Narrating action {}", i);
                let url = narrator.narrate(&action.value).await?;
                assets.push(AuxiliaryAsset {
                    text: action.value.clone(),
                    resolved_media_url: url,
                });
            }
            let local = (i + 1) as f64 / actions.len() as f64 * 100.0;
            self.progress.report(ProgressSegment::NARRATION.rescale(local), NARRATION_LABEL);
        }
        info!("Narrated {} action(s)", assets.len());
        Ok(assets)
    }
}
