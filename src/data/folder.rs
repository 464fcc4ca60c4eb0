use burn::tensor::TensorData;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::{
    data::GanDataset,
    error::{GanError, Result},
    utils::load_image,
};

/// Images laid out as `root/{train,test}/<class>/*.{png,jpg,jpeg}`.
///
/// Classes are numbered by the sorted order of their directory names within each split.
#[derive(Debug, Clone)]
pub struct ImageFolderDataset {
    name: String,
    image_shape: [usize; 3],
    train: Vec<(PathBuf, i64)>,
    test: Vec<(PathBuf, i64)>,
}

impl ImageFolderDataset {
    pub fn new<P: AsRef<Path>>(name: &str, root: P, image_shape: [usize; 3]) -> Result<Self> {
        let [channels, _, _] = image_shape;
        if channels != 1 && channels != 3 {
            return Err(GanError::data(format!(
                "only 1 or 3 channel images are supported, got {channels}"
            )));
        }

        let train = scan_split(&root.as_ref().join("train"))?;
        let test = scan_split(&root.as_ref().join("test"))?;

        Ok(Self {
            name: name.to_string(),
            image_shape,
            train,
            test,
        })
    }

    fn load_split(&self, files: &[(PathBuf, i64)]) -> Result<(TensorData, TensorData)> {
        let [c, h, w] = self.image_shape;
        let mut pixels = Vec::with_capacity(files.len() * c * h * w);
        let mut labels = Vec::with_capacity(files.len());
        for (path, label) in files {
            pixels.extend(load_image(path, self.image_shape)?);
            labels.push(*label);
        }

        Ok((
            TensorData::new(pixels, [files.len(), c, h, w]),
            TensorData::new(labels, [files.len()]),
        ))
    }
}

fn is_image(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("jpg") | Some("jpeg") | Some("png")
    )
}

fn scan_split(split_root: &Path) -> Result<Vec<(PathBuf, i64)>> {
    if !split_root.is_dir() {
        return Err(GanError::data(format!(
            "{} is not a directory",
            split_root.display()
        )));
    }

    let mut classes = std::fs::read_dir(split_root)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect::<Vec<_>>();
    classes.sort();

    let mut files = Vec::new();
    for (label, class_dir) in classes.iter().enumerate() {
        let mut class_files = WalkDir::new(class_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .filter(|path| is_image(path))
            .collect::<Vec<_>>();
        class_files.sort();
        files.extend(class_files.into_iter().map(|path| (path, label as i64)));
    }

    Ok(files)
}

impl GanDataset for ImageFolderDataset {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_train(&self) -> usize {
        self.train.len()
    }

    fn num_test(&self) -> usize {
        self.test.len()
    }

    fn get_data_train(&self) -> Result<(TensorData, TensorData)> {
        self.load_split(&self.train)
    }

    fn get_data_test(&self) -> Result<(TensorData, TensorData)> {
        self.load_split(&self.test)
    }
}
