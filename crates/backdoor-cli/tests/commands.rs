//! Command tests against temporary files.

use backdoor_cli::{Cli, Commands, InspectCommand, PoisonCommand};
use clap::Parser;
use image::{Rgb, RgbImage};

fn poison_command(args: &[&str]) -> PoisonCommand {
    let argv: Vec<&str> = ["backdoor", "poison"]
        .into_iter()
        .chain(args.iter().copied())
        .collect();
    match Cli::try_parse_from(argv).unwrap().command {
        Commands::Poison(cmd) => cmd,
        other => panic!("unexpected command {other:?}"),
    }
}

fn inspect_command(args: &[&str]) -> InspectCommand {
    let argv: Vec<&str> = ["backdoor", "inspect"]
        .into_iter()
        .chain(args.iter().copied())
        .collect();
    match Cli::try_parse_from(argv).unwrap().command {
        Commands::Inspect(cmd) => cmd,
        other => panic!("unexpected command {other:?}"),
    }
}

#[test]
fn poison_badnets_writes_patched_png() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("clean.png");
    let output = dir.path().join("poisoned.png");
    RgbImage::from_pixel(10, 10, Rgb([0, 0, 0])).save(&input).unwrap();

    let cmd = poison_command(&[
        "--input",
        input.to_str().unwrap(),
        "--output",
        output.to_str().unwrap(),
        "--trigger-size",
        "3",
    ]);
    cmd.run().unwrap();

    let poisoned = image::open(&output).unwrap().to_rgb8();
    assert_eq!(poisoned.get_pixel(6, 6).0, [255, 255, 255]);
    assert_eq!(poisoned.get_pixel(8, 8).0, [255, 255, 255]);
    assert_eq!(poisoned.get_pixel(9, 9).0, [0, 0, 0]);
    assert_eq!(poisoned.get_pixel(5, 5).0, [0, 0, 0]);
}

#[test]
fn poison_blend_from_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("clean.png");
    let pattern = dir.path().join("pattern.png");
    let output = dir.path().join("blended.png");
    let config = dir.path().join("trigger.json");
    RgbImage::from_pixel(6, 6, Rgb([0, 0, 0])).save(&input).unwrap();
    RgbImage::from_pixel(3, 3, Rgb([255, 255, 255])).save(&pattern).unwrap();
    let json = serde_json::json!({ "kind": "blend", "trigger_path": pattern, "alpha": 0.1 });
    std::fs::write(&config, json.to_string()).unwrap();

    let cmd = poison_command(&[
        "-i",
        input.to_str().unwrap(),
        "-o",
        output.to_str().unwrap(),
        "--config",
        config.to_str().unwrap(),
    ]);
    cmd.run().unwrap();

    let blended = image::open(&output).unwrap().to_rgb8();
    assert!(blended.pixels().all(|p| p.0 == [25, 25, 25]));
}

#[test]
fn poison_blend_requires_pattern() {
    let cmd = poison_command(&["-i", "in.png", "-o", "out.png", "--trigger", "blend"]);
    // The pattern may also come from the environment.
    if std::env::var_os("BACKDOOR_BLEND_PATTERN").is_none() {
        assert!(cmd.trigger_config().is_err());
    }
}

#[test]
fn inspect_random_batch_report() {
    let cmd = inspect_command(&[
        "--depth",
        "10",
        "--widen-factor",
        "1",
        "--num-classes",
        "5",
        "--attention",
        "depthwise",
        "--partial",
        "0.5",
        "--seed",
        "3",
        "--batch-size",
        "2",
        "--image-size",
        "16",
    ]);
    let report = cmd.inspect().unwrap();
    assert_eq!(report.logits_shape, vec![2, 5]);
    assert_eq!(report.gates_shape, vec![2, 32]);
    assert_eq!(report.predictions.len(), 2);
    assert!(report.predictions.iter().all(|&p| p < 5));
    assert_eq!(report.gate_stats.len(), 1);
    let stats = &report.gate_stats[0];
    assert!(stats.min > 0.0 && stats.max < 1.0 && stats.min <= stats.mean);
}

#[test]
fn inspect_images_with_saved_weights() {
    use backdoor_nn::{StateDict, WideResNetConfig};

    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("model.json");
    let weights = dir.path().join("model.safetensors");
    let image_path = dir.path().join("img.png");

    let config = WideResNetConfig::new(3)
        .with_depth(10)
        .with_widen_factor(1)
        .with_seed(1);
    std::fs::write(&config_path, serde_json::to_string(&config).unwrap()).unwrap();
    config
        .build(&backdoor_nn::tensor::Device::Cpu)
        .unwrap()
        .save_weights(&weights)
        .unwrap();
    RgbImage::from_pixel(16, 16, Rgb([120, 60, 30])).save(&image_path).unwrap();

    let cmd = inspect_command(&[
        "--config",
        config_path.to_str().unwrap(),
        "--weights",
        weights.to_str().unwrap(),
        "--normalize",
        image_path.to_str().unwrap(),
        image_path.to_str().unwrap(),
    ]);
    let report = cmd.inspect().unwrap();
    assert_eq!(report.logits_shape, vec![2, 3]);
    assert_eq!(report.gates_shape, vec![2, 64]);
    // identical images give identical predictions in eval mode
    assert_eq!(report.predictions[0], report.predictions[1]);
}

#[test]
fn inspect_rejects_bad_depth() {
    let cmd = inspect_command(&["--depth", "27"]);
    assert!(cmd.model_config().is_err());
}

#[test]
fn poison_writes_to_output_path_and_keeps_input() {
    let dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("clean.png");
    let output = out_dir.path().join("poisoned.png");
    RgbImage::from_pixel(8, 8, Rgb([0, 0, 0])).save(&input).unwrap();

    let cmd = poison_command(&["-i", input.to_str().unwrap(), "-o", output.to_str().unwrap()]);
    cmd.run().unwrap();

    assert!(output.exists());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    let clean = image::open(&input).unwrap().to_rgb8();
    assert!(clean.pixels().all(|p| p.0 == [0, 0, 0]));
}

#[test]
fn inspect_rejects_huge_widen_factor() {
    let huge = (usize::MAX / 2).to_string();
    let cmd = inspect_command(&["--widen-factor", &huge]);
    assert!(cmd.model_config().is_err());
}
