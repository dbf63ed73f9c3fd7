use gans::activator::Activator;
use gans::gan::{Schedule, Vector};
use gans::layers::{Dense, Network};
use gans::sgd::{Logging, RmsProp, StopCondition, Trainer};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, Uniform};
use std::{env, fs, process};
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;

const RANDOM_SIZE: usize = 4;

/// Points scattered around the unit circle.
fn generate_data(num_samples: usize, rng: &mut impl Rng) -> Vec<Vec<f64>> {
    let radians = Uniform::new(0.0, 2.0 * std::f64::consts::PI);
    let noise = Normal::new(0.0, 0.05).unwrap();
    (0..num_samples)
        .map(|_| {
            let theta = radians.sample(rng);
            vec![theta.cos() + noise.sample(rng), theta.sin() + noise.sample(rng)]
        })
        .collect()
}

fn new_model(rng: &mut StdRng) -> Vector {
    let generator = Network::new(vec![
        Dense::new(Activator::TanH, RANDOM_SIZE, 16, rng).into(),
        Dense::new(Activator::Identity, 16, 2, rng).into(),
    ]);
    let discriminator = Network::new(vec![
        Dense::new(Activator::TanH, 2, 16, rng).into(),
        Dense::new(Activator::Identity, 16, 1, rng).into(),
    ]);
    Vector::new(generator, discriminator, RANDOM_SIZE, StdRng::from_rng(&mut *rng).unwrap())
        .schedule(Schedule::new(1, 2))
        .gen_transformer(RmsProp::default())
        .disc_transformer(RmsProp::default())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(LevelFilter::INFO.into()),
        )
        .init();

    let model_file = env::args().nth(1);
    let mut rng = StdRng::from_entropy();

    let gan = match model_file.as_ref().filter(|p| fs::metadata(p).is_ok()) {
        Some(path) => {
            info!(path = path.as_str(), "resuming from saved model");
            let loaded = fs::read(path)
                .map_err(gans::Error::from)
                .and_then(|data| Vector::deserialize(&data, StdRng::from_rng(&mut rng).unwrap()));
            match loaded {
                Ok(gan) => gan,
                Err(e) => {
                    error!(path = path.as_str(), "cannot load model: {}", e);
                    process::exit(1);
                }
            }
        }
        None => new_model(&mut rng),
    };

    let training_data = generate_data(10_000, &mut rng);
    let mut gan = Trainer::new(gan)
        .step_size(0.01)
        .batch_size(32)
        .logging(Logging::Iterations(500))
        .stop_condition(StopCondition::Iterations(5_000))
        .train(&training_data, &mut rng);

    if let Some(path) = &model_file {
        if let Err(e) = gan.serialize().and_then(|data| Ok(fs::write(path, data)?)) {
            error!(path = path.as_str(), "cannot save model: {}", e);
            process::exit(1);
        }
    }

    println!();
    for _ in 0..10 {
        let p = gan.generate();
        println!(
            "({:+.3}, {:+.3}) radius {:.3}",
            p[0],
            p[1],
            (p[0] * p[0] + p[1] * p[1]).sqrt()
        );
    }
}
