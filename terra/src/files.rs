use anyhow::{anyhow, bail, Context, Result};
use directories::UserDirs;
use std::path::{Path, PathBuf};

use crate::settings::{CoreSettings, Settings};

const CORE_SETTINGS_FILE_NAME: &str = "core_config.yaml";
const USER_SETTINGS_FILE_NAME: &str = "settings.yaml";
const SETTINGS_DIR_NAME: &str = "settings";

pub struct FileContext {
    /// Engine settings.
    pub core_settings: CoreSettings,
    /// Root directory for saved worlds. Each save is a folder of chunk files.
    pub save_root: PathBuf,
    /// Root directory for user settings.
    pub settings_root: PathBuf,
    /// Root directory for data files, which are not meant to change except in development.
    pub data_root: PathBuf,
}

impl FileContext {
    pub fn new(
        core_settings: CoreSettings,
        data_root: PathBuf,
        user_data_root: PathBuf,
        save_root: Option<PathBuf>,
    ) -> Self {
        let save_root =
            save_root.unwrap_or_else(|| user_data_root.join(&core_settings.save_dir_name));
        let settings_root = user_data_root.join(SETTINGS_DIR_NAME);

        FileContext {
            core_settings,
            data_root,
            save_root,
            settings_root,
        }
    }

    /// Reads the core settings under `data_root`. User data goes in the documents directory
    /// unless `save_root` overrides where saves live.
    pub fn load(data_root: PathBuf, save_root: Option<PathBuf>) -> Result<Self> {
        log::info!("working directory is {:?}", std::env::current_dir()?);

        let core_settings = Self::load_core_settings(&data_root)?;

        let user_dirs =
            UserDirs::new().ok_or_else(|| anyhow!("Could not find user directories."))?;
        let docs_dir = user_dirs
            .document_dir()
            .ok_or_else(|| anyhow!("Could not find document directory."))?;

        let user_data_root = docs_dir.join(&core_settings.path_name);

        Ok(FileContext::new(
            core_settings,
            data_root,
            user_data_root,
            save_root,
        ))
    }

    pub fn load_core_settings(data_root: &Path) -> Result<CoreSettings> {
        let core_settings_path = data_root.join(CORE_SETTINGS_FILE_NAME);
        log::info!("loading core settings from {:?}", core_settings_path);

        let file = std::fs::File::open(&core_settings_path).context(format!(
            "Opening core settings file {}",
            core_settings_path.to_string_lossy()
        ))?;
        Ok(serde_yaml::from_reader(file).context("Parsing core settings file")?)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.save_root)?;
        std::fs::create_dir_all(&self.settings_root)?;
        if !self.data_root.is_dir() {
            bail!(
                "Could not find data root at {}",
                self.data_root.to_string_lossy()
            );
        }

        Ok(())
    }

    pub fn load_settings(&self) -> Result<Settings> {
        let fp = self.settings_root.join(USER_SETTINGS_FILE_NAME);

        if fp.is_file() {
            log::info!("Loading settings from {:?}", fp);
            let file = std::fs::File::open(&fp).context("Opening settings file")?;
            Ok(serde_yaml::from_reader(file).context("Parsing settings file")?)
        } else {
            log::info!("Creating default settings file {:?}", fp);
            let settings = Settings::default();
            let file = std::fs::File::create(&fp).context("Creating settings file")?;
            serde_yaml::to_writer(file, &settings).context("Serializing settings")?;
            Ok(settings)
        }
    }

    /// Folder holding the chunk files of one saved world.
    pub fn save_dir(&self, save_name: &str) -> Result<PathBuf> {
        if save_name.is_empty()
            || save_name == "."
            || save_name == ".."
            || save_name.contains(|c: char| c == '/' || c == '\\')
        {
            bail!("Invalid save name {:?}", save_name);
        }

        Ok(self.save_root.join(save_name))
    }
}
