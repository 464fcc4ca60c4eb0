use std::{env, error::Error};

use gan_trainer::{
    logging, GanTrainer, ImageFolderDataset, ModelConfig, TrainerConfig,
};

#[cfg(not(feature = "wgpu"))]
type MyBackend = burn::backend::NdArray<f32>;
#[cfg(feature = "wgpu")]
type MyBackend = burn::backend::Wgpu<f32>;

type MyAutodiffBackend = burn::backend::Autodiff<MyBackend>;

fn main() -> Result<(), Box<dyn Error>> {
    logging::init();

    let data_dir = env::var("GAN_DATA_DIR").unwrap_or_else(|_| "data".to_string());
    let log_dir = env::var("GAN_LOG_DIR").unwrap_or_else(|_| "/tmp/gan".to_string());
    let image_shape = [3, 32, 32];

    let device = Default::default();
    let model = ModelConfig::for_images(image_shape, 64).init();
    let dataset = ImageFolderDataset::new("images", &data_dir, image_shape)?;
    let config = TrainerConfig::new(log_dir).with_num_train_steps(10000);

    let trainer = GanTrainer::<MyAutodiffBackend, _, _>::new(model, dataset, config, device)?;
    let report = trainer.train_model(None)?;
    tracing::info!(
        steps = report.steps_run,
        global_step = report.global_step,
        checkpoints = report.checkpoints.len(),
        "training finished"
    );

    #[cfg(feature = "inception")]
    {
        use gan_trainer::inception::InceptionClassifier;

        let weights = env::var("GAN_INCEPTION_WEIGHTS")
            .unwrap_or_else(|_| "models/inception_v3".to_string());
        let classifier = InceptionClassifier::load(std::path::Path::new(&weights), trainer.device())?;
        let (fid, is) = trainer.test_gan_all(10000, &classifier)?;
        tracing::info!("FID: {fid}  IS: {is}");
    }

    Ok(())
}
