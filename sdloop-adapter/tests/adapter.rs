#![cfg(unix)]

use std::path::{Path, PathBuf};

use sdloop_adapter::{Adapter, AdapterConfig, AdapterError, ModelPreset, PipelineCommand};
use sdloop_core::Mode;

/// Speaks the pipeline protocol without loading a model: each generation writes
/// `prompt|seed` to the output path. A request with the prompt `die` makes it exit without
/// generating.
const FAKE_PIPELINE: &str = r#"
mode="$1"
log="$2"
shift 2
echo "launch $mode" >> "$log"
printf '%s\n' "${HF_HOME:-}" > "$log.hf_home"
interactive=0
while [ $# -gt 0 ]; do
    case "$1" in
        --prompt) prompt="$2"; shift 2 ;;
        --output) output="$2"; shift 2 ;;
        --seed) seed="$2"; shift 2 ;;
        --interactive) interactive=1; shift ;;
        *) shift ;;
    esac
done

generate() {
    printf '%s|%s\n' "$prompt" "$seed" > "$output"
}

generate
[ "$interactive" = 1 ] || exit 0
while :; do
    echo GENERATION_DONE
    echo "next prompt:"
    IFS= read -r prompt || exit 0
    [ "$prompt" = die ] && exit 5
    echo "next output:"
    IFS= read -r output || exit 0
    if [ "$mode" != t2i ]; then
        echo "init image:"
        IFS= read -r init || exit 0
    fi
    if [ "$mode" = inpaint ]; then
        echo "mask image:"
        IFS= read -r mask || exit 0
    fi
    seed=$((seed + 1))
    generate
done
"#;

fn fake_config(dir: &Path, keep_pipeline_running: bool) -> AdapterConfig {
    let script = dir.join("pipeline.sh");
    std::fs::write(&script, FAKE_PIPELINE).unwrap();
    let log = dir.join("launches.log");
    let command = |mode: &str| {
        PipelineCommand::new("/bin/sh").with_args([
            script.to_string_lossy().into_owned(),
            mode.to_string(),
            log.to_string_lossy().into_owned(),
        ])
    };
    AdapterConfig {
        text_to_image: command("t2i"),
        image_to_image: command("i2i"),
        inpaint: command("inpaint"),
        models: ModelPreset::sd15(),
        hf_home: None,
        keep_pipeline_running,
        extra_args: Vec::new(),
    }
}

fn launches(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("launches.log"))
        .map(|log| log.lines().map(|line| line.trim_end().to_string()).collect())
        .unwrap_or_default()
}

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap().trim_end().to_string()
}

fn touch(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"png").unwrap();
    path
}

#[tokio::test]
async fn stateless_calls_launch_every_time() {
    let dir = tempfile::tempdir().unwrap();
    let mut adapter = Adapter::new(fake_config(dir.path(), false));

    let first = dir.path().join("1.jpg");
    let second = dir.path().join("2.jpg");
    adapter.text_to_image("a fox", &first, 3).await.unwrap();
    adapter.text_to_image("a hare", &second, 40).await.unwrap();

    assert_eq!(read(&first), "a fox|3");
    assert_eq!(read(&second), "a hare|40");
    assert_eq!(launches(dir.path()).len(), 2);
    assert_eq!(adapter.current_pipeline(), None);
}

#[tokio::test]
async fn running_pipeline_is_reused() {
    let dir = tempfile::tempdir().unwrap();
    let mut adapter = Adapter::new(fake_config(dir.path(), true));

    for (i, seed) in [7, 8, 9].into_iter().enumerate() {
        let output = dir.path().join(format!("{i}.jpg"));
        adapter
            .text_to_image(&format!("frame {i}"), &output, seed)
            .await
            .unwrap();
        assert_eq!(read(&output), format!("frame {i}|{seed}"));
    }

    assert_eq!(launches(dir.path()), ["launch t2i"]);
    assert_eq!(adapter.current_pipeline(), Some(Mode::TextToImage));
    adapter.shutdown().await.unwrap();
    assert_eq!(adapter.current_pipeline(), None);
}

#[tokio::test]
async fn reused_pipeline_keeps_its_own_seed_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let mut adapter = Adapter::new(fake_config(dir.path(), true));

    let first = dir.path().join("1.jpg");
    let second = dir.path().join("2.jpg");
    adapter.text_to_image("a", &first, 7).await.unwrap();
    adapter.text_to_image("b", &second, 100).await.unwrap();

    assert_eq!(read(&second), "b|8");
    adapter.shutdown().await.unwrap();
}

#[tokio::test]
async fn switching_kind_relaunches() {
    let dir = tempfile::tempdir().unwrap();
    let mut adapter = Adapter::new(fake_config(dir.path(), true));
    let init = touch(dir.path(), "init.png");
    let mask = touch(dir.path(), "mask.png");

    adapter
        .text_to_image("a boat", &dir.path().join("1.jpg"), 1)
        .await
        .unwrap();
    adapter
        .image_to_image("a boat at night", &init, &dir.path().join("2.jpg"), 2, 0.3)
        .await
        .unwrap();
    assert_eq!(adapter.current_pipeline(), Some(Mode::ImageToImage));

    // Same kind but another strength needs new launch flags.
    adapter
        .image_to_image("a boat in fog", &init, &dir.path().join("3.jpg"), 3, 0.6)
        .await
        .unwrap();
    adapter
        .inpaint("a red sail", &init, &mask, &dir.path().join("4.jpg"), 4)
        .await
        .unwrap();
    adapter
        .inpaint("a blue sail", &init, &mask, &dir.path().join("5.jpg"), 5)
        .await
        .unwrap();

    assert_eq!(
        launches(dir.path()),
        ["launch t2i", "launch i2i", "launch i2i", "launch inpaint"]
    );
    assert_eq!(read(&dir.path().join("5.jpg")), "a blue sail|5");
    adapter.shutdown().await.unwrap();
}

#[tokio::test]
async fn missing_init_image_is_rejected_before_launch() {
    let dir = tempfile::tempdir().unwrap();
    let mut adapter = Adapter::new(fake_config(dir.path(), true));
    let init = dir.path().join("absent.png");

    let err = adapter
        .image_to_image("p", &init, &dir.path().join("out.jpg"), 1, 0.3)
        .await
        .unwrap_err();

    assert!(matches!(err, AdapterError::MissingInput(path) if path == init));
    assert!(launches(dir.path()).is_empty());
}

#[tokio::test]
async fn multi_line_prompts_are_flattened() {
    let dir = tempfile::tempdir().unwrap();
    let mut adapter = Adapter::new(fake_config(dir.path(), true));

    let first = dir.path().join("1.jpg");
    let second = dir.path().join("2.jpg");
    adapter.text_to_image("a cat\non a mat", &first, 1).await.unwrap();
    adapter.text_to_image("a dog\r\nin fog", &second, 2).await.unwrap();

    assert_eq!(read(&first), "a cat on a mat|1");
    assert_eq!(read(&second), "a dog  in fog|2");
    assert_eq!(launches(dir.path()).len(), 1);
    adapter.shutdown().await.unwrap();
}

#[tokio::test]
async fn hf_home_is_exported() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fake_config(dir.path(), false);
    config.hf_home = Some(PathBuf::from("/srv/hf"));
    let mut adapter = Adapter::new(config);

    adapter
        .text_to_image("p", &dir.path().join("out.jpg"), 1)
        .await
        .unwrap();

    assert_eq!(read(&dir.path().join("launches.log.hf_home")), "/srv/hf");
}

fn dying_config(keep_pipeline_running: bool) -> AdapterConfig {
    let command = PipelineCommand::new("/bin/sh").with_args(["-c", "exit 3"]);
    AdapterConfig {
        text_to_image: command.clone(),
        image_to_image: command.clone(),
        inpaint: command,
        models: ModelPreset::sd15(),
        hf_home: None,
        keep_pipeline_running,
        extra_args: Vec::new(),
    }
}

#[tokio::test]
async fn pipeline_dying_before_done_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let mut adapter = Adapter::new(dying_config(true));

    let err = adapter
        .text_to_image("p", &dir.path().join("out.jpg"), 1)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AdapterError::PipelineExited {
            mode: Mode::TextToImage,
            ..
        }
    ));
    assert_eq!(adapter.current_pipeline(), None);
}

#[tokio::test]
async fn failed_stateless_run_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let mut adapter = Adapter::new(dying_config(false));

    let err = adapter
        .text_to_image("p", &dir.path().join("out.jpg"), 1)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AdapterError::PipelineFailed {
            mode: Mode::TextToImage,
            ..
        }
    ));
}

#[tokio::test]
async fn missing_program_is_a_spawn_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = AdapterConfig::from_bin_dir(dir.path(), ModelPreset::sd15(), false);
    let mut adapter = Adapter::new(config);

    let err = adapter
        .text_to_image("p", &dir.path().join("out.jpg"), 1)
        .await
        .unwrap_err();

    assert!(matches!(err, AdapterError::Spawn { .. }));
}

#[tokio::test]
async fn failed_running_pipeline_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let mut adapter = Adapter::new(fake_config(dir.path(), true));

    adapter
        .text_to_image("first", &dir.path().join("1.jpg"), 1)
        .await
        .unwrap();
    let err = adapter
        .text_to_image("die", &dir.path().join("2.jpg"), 2)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AdapterError::PipelineExited {
            mode: Mode::TextToImage,
            ..
        }
    ));
    assert_eq!(adapter.current_pipeline(), None);
    assert!(!dir.path().join("2.jpg").exists());

    let third = dir.path().join("3.jpg");
    adapter.text_to_image("third", &third, 3).await.unwrap();
    assert_eq!(read(&third), "third|3");
    assert_eq!(launches(dir.path()), ["launch t2i", "launch t2i"]);
    adapter.shutdown().await.unwrap();
}

#[tokio::test]
async fn paths_with_line_breaks_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut adapter = Adapter::new(fake_config(dir.path(), true));
    let output = dir.path().join("out\nput.jpg");

    let err = adapter.text_to_image("p", &output, 1).await.unwrap_err();

    assert!(matches!(err, AdapterError::MultiLinePath(path) if path == output));
    assert!(launches(dir.path()).is_empty());
}
