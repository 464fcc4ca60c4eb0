pub mod folder;

use burn::{
    data::{
        dataloader::{batcher::Batcher, DataLoader, DataLoaderBuilder, DataLoaderIterator},
        dataset::InMemDataset,
    },
    tensor::{backend::Backend, DType, Int, Tensor, TensorData},
};
use std::{
    sync::{
        mpsc::{self, Receiver},
        Arc,
    },
    thread,
};

use crate::error::{GanError, Result};

// ////////////////////////////////////////////////////////////////////////////
// Dataset capability set
pub trait GanDataset {
    fn name(&self) -> &str;
    fn num_train(&self) -> usize;
    fn num_test(&self) -> usize;
    /// `(images [N, C, H, W] float, labels [N] int)`
    fn get_data_train(&self) -> Result<(TensorData, TensorData)>;
    fn get_data_test(&self) -> Result<(TensorData, TensorData)>;
}

#[derive(Debug, Clone)]
pub struct GanItem {
    pub image: Vec<f32>,
    pub label: i64,
}

fn is_float(dtype: DType) -> bool {
    matches!(dtype, DType::F64 | DType::F32 | DType::F16 | DType::BF16)
}

fn is_int(dtype: DType) -> bool {
    matches!(
        dtype,
        DType::I64
            | DType::I32
            | DType::I16
            | DType::I8
            | DType::U64
            | DType::U32
            | DType::U16
            | DType::U8
    )
}

/// Checks ranks, dtypes and shapes of a dataset split and unpacks it into items.
pub fn validate_arrays(
    images: TensorData,
    labels: TensorData,
    image_shape: [usize; 3],
) -> Result<Vec<GanItem>> {
    if images.shape.len() != 4 {
        return Err(GanError::data(format!(
            "images must have rank 4 [N, C, H, W], got shape {:?}",
            images.shape
        )));
    }
    if !is_float(images.dtype) {
        return Err(GanError::data(format!(
            "images must hold floats, got {:?}",
            images.dtype
        )));
    }
    if images.shape[1..] != image_shape {
        return Err(GanError::data(format!(
            "image shape {:?} does not match the model's {:?}",
            &images.shape[1..],
            image_shape
        )));
    }
    if labels.shape.len() != 1 {
        return Err(GanError::data(format!(
            "labels must have rank 1, got shape {:?}",
            labels.shape
        )));
    }
    if !is_int(labels.dtype) {
        return Err(GanError::data(format!(
            "labels must hold integers, got {:?}",
            labels.dtype
        )));
    }

    let num_samples = images.shape[0];
    if labels.shape[0] != num_samples {
        return Err(GanError::data(format!(
            "{} images but {} labels",
            num_samples, labels.shape[0]
        )));
    }
    if num_samples == 0 {
        return Err(GanError::data("dataset split is empty"));
    }

    let pixels = images
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| GanError::data(format!("unreadable images: {e:?}")))?;
    let labels = labels
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|e| GanError::data(format!("unreadable labels: {e:?}")))?;

    let sample_len = image_shape.iter().product::<usize>();
    Ok(pixels
        .chunks_exact(sample_len)
        .zip(labels)
        .map(|(image, label)| GanItem {
            image: image.to_vec(),
            label,
        })
        .collect())
}

// ////////////////////////////////////////////////////////////////////////////
// Batcher
#[derive(Debug, Clone)]
pub struct GanBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub labels: Tensor<B, 1, Int>,
}

impl<B: Backend> GanBatch<B> {
    pub fn size(&self) -> usize {
        self.images.dims()[0]
    }
}

#[derive(Debug, Clone)]
pub struct GanBatcher {
    image_shape: [usize; 3],
}

impl GanBatcher {
    pub fn new(image_shape: [usize; 3]) -> Self {
        Self { image_shape }
    }
}

impl<B: Backend> Batcher<B, GanItem, GanBatch<B>> for GanBatcher {
    fn batch(&self, items: Vec<GanItem>, device: &B::Device) -> GanBatch<B> {
        let [c, h, w] = self.image_shape;
        let size = items.len();

        let mut pixels = Vec::with_capacity(size * c * h * w);
        let mut labels = Vec::with_capacity(size);
        for item in items {
            pixels.extend_from_slice(&item.image);
            labels.push(item.label);
        }

        let images = Tensor::<B, 4>::from_data(TensorData::new(pixels, [size, c, h, w]), device);
        let labels = Tensor::<B, 1, Int>::from_data(TensorData::new(labels, [size]), device);

        GanBatch { images, labels }
    }
}

// ////////////////////////////////////////////////////////////////////////////
// Feeds
#[derive(Debug, Clone, Copy)]
pub struct FeedOptions {
    pub batch_size: usize,
    pub image_shape: [usize; 3],
    pub seed: u64,
    /// Depth of the prefetch queue, in batches.
    pub prefetch: usize,
}

/// Endless stream of shuffled, full training batches prepared on a background thread.
pub struct TrainFeed<B: Backend> {
    receiver: Receiver<Vec<GanItem>>,
    batcher: GanBatcher,
    device: B::Device,
}

impl<B: Backend> TrainFeed<B> {
    pub fn new<D: GanDataset + ?Sized>(
        dataset: &D,
        options: FeedOptions,
        device: &B::Device,
    ) -> Result<Self> {
        if options.batch_size == 0 {
            return Err(GanError::config("batch size must be positive"));
        }
        let (images, labels) = dataset.get_data_train()?;
        let items = validate_arrays(images, labels, options.image_shape)?;
        tracing::info!(
            dataset = dataset.name(),
            samples = items.len(),
            batch_size = options.batch_size,
            "training feed ready"
        );

        let receiver = spawn_producer::<B>(InMemDataset::new(items), options, device.clone())?;

        Ok(Self {
            receiver,
            batcher: GanBatcher::new(options.image_shape),
            device: device.clone(),
        })
    }

    pub fn next_batch(&mut self) -> Result<GanBatch<B>> {
        let items = self
            .receiver
            .recv()
            .map_err(|_| GanError::data("training feed producer stopped"))?;
        Ok(self.batcher.batch(items, &self.device))
    }
}

// Hands shuffled item chunks to the producer; tensors are built on the consumer side.
#[derive(Debug, Clone)]
struct ItemBatcher;

impl<B: Backend> Batcher<B, GanItem, Vec<GanItem>> for ItemBatcher {
    fn batch(&self, items: Vec<GanItem>, _device: &B::Device) -> Vec<GanItem> {
        items
    }
}

// Every `iter()` of a shuffled loader is a fresh permutation of the whole training set.
// Chunks are regrouped so that batches straddle epoch boundaries and are always full.
fn spawn_producer<B: Backend>(
    dataset: InMemDataset<GanItem>,
    options: FeedOptions,
    device: B::Device,
) -> Result<Receiver<Vec<GanItem>>> {
    let (sender, receiver) = mpsc::sync_channel(options.prefetch);
    let batch_size = options.batch_size;

    thread::Builder::new()
        .name("gan-train-feed".into())
        .spawn(move || {
            let loader: Arc<dyn DataLoader<B, Vec<GanItem>>> =
                DataLoaderBuilder::new(ItemBatcher)
                    .batch_size(batch_size)
                    .shuffle(options.seed)
                    .set_device(device)
                    .build(dataset);

            let mut pending = Vec::with_capacity(batch_size);
            loop {
                for chunk in loader.iter() {
                    pending.extend(chunk);
                    while pending.len() >= batch_size {
                        let batch = pending.drain(..batch_size).collect::<Vec<_>>();
                        // The consumer hung up.
                        if sender.send(batch).is_err() {
                            return;
                        }
                    }
                }
            }
        })?;

    Ok(receiver)
}

/// One ordered pass over the test split. The last batch may be short.
pub struct TestFeed<B: Backend> {
    loader: Arc<dyn DataLoader<B, GanBatch<B>>>,
    batch_size: usize,
}

impl<B: Backend> TestFeed<B> {
    pub fn new<D: GanDataset + ?Sized>(
        dataset: &D,
        options: FeedOptions,
        device: &B::Device,
    ) -> Result<Self> {
        if options.batch_size == 0 {
            return Err(GanError::config("batch size must be positive"));
        }
        let (images, labels) = dataset.get_data_test()?;
        let items = validate_arrays(images, labels, options.image_shape)?;

        let loader = DataLoaderBuilder::new(GanBatcher::new(options.image_shape))
            .batch_size(options.batch_size)
            .set_device(device.clone())
            .build(InMemDataset::new(items));

        Ok(Self {
            loader,
            batch_size: options.batch_size,
        })
    }

    pub fn num_samples(&self) -> usize {
        self.loader.num_items()
    }

    pub fn num_batches(&self) -> usize {
        self.num_samples().div_ceil(self.batch_size)
    }

    pub fn iter(&self) -> Box<dyn DataLoaderIterator<GanBatch<B>> + '_> {
        self.loader.iter()
    }
}
