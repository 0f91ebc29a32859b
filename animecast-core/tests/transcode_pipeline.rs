mod support;

use animecast_core::progress::lock_key;
use animecast_core::{FailureKind, MediaType, StateStore, TranscodeError, TranscodeJob, TranscodeStage};

use support::{EncodeScript, Harness, ScriptedRunner};

const ANIME_ID: i64 = 7;

fn full_length_script() -> EncodeScript {
    EncodeScript::success(&[
        "frame=10\nout_time_us=150000000\nprogress=continue\n",
        "out_time_ms=300000\r",
        "out_time=00:07:30.000000\nprogress=continue\n",
        "out_time_us=600000000\nprogress=end\n",
    ])
}

#[tokio::test]
async fn transcodes_eligible_ladder_and_records_media() {
    let runner = ScriptedRunner::new("1920x1080\n", Some(600.0))
        .script("1080p", full_length_script())
        .script("720p", full_length_script());
    let harness = Harness::new(runner);
    let episode = harness.episode(ANIME_ID, 3);
    let source = harness.upload("ep3.mkv");
    harness.tracker.acquire_lock(ANIME_ID, episode.id).unwrap();

    let job = TranscodeJob::new(episode.id, source.clone())
        .qualities("1080,720,2160")
        .language("ru");
    let report = harness.orchestrator().run(&job).await.unwrap();

    let labels: Vec<_> = report.renditions.iter().map(|r| r.label.as_str()).collect();
    assert_eq!(labels, vec!["1080p", "720p"]);
    assert_eq!(report.skipped, vec!["2160"]);
    assert_eq!(report.primary().unwrap().label, "1080p");
    assert_eq!(
        report.renditions[1].public_url.as_deref(),
        Some("/storage/videos/anime/7/s1/e3/ru-720p.mp4")
    );

    let media = harness.media.list_media(episode.id).unwrap();
    assert_eq!(media.len(), 2);
    let primary: Vec<_> = media.iter().filter(|row| row.is_primary).collect();
    assert_eq!(primary.len(), 1);
    assert_eq!(primary[0].quality.as_deref(), Some("1080p"));
    for row in &media {
        assert_eq!(row.media_type, MediaType::Video);
        assert_eq!(row.language.as_deref(), Some("ru"));
        assert_eq!(row.mime.as_deref(), Some("video/mp4"));
        assert_eq!(row.duration, Some(600));
        assert!(row.size.unwrap() > 0);
        assert!(harness.config.public_root().join(&row.path).is_file());
    }

    let progress = harness.tracker.get_progress(episode.id).unwrap();
    assert_eq!(progress.stage, TranscodeStage::Done);
    assert_eq!(progress.progress, 100.0);
    assert_eq!(progress.error, None);

    assert_eq!(harness.store.get(&lock_key(ANIME_ID)).unwrap(), None);
    assert!(report.source_removed);
    assert!(!harness.source_root().join(&source).exists());

    let started = harness.runner.started.lock().unwrap().clone();
    assert_eq!(started.len(), 2);
    assert_eq!(started[0][1], "-n");
    let crf = started[0].iter().position(|arg| arg == "-crf").unwrap();
    assert_eq!(started[0][crf + 1], "20");
}

#[tokio::test]
async fn progress_history_is_ordered() {
    let runner = ScriptedRunner::new("1920x1080", Some(600.0))
        .script("1080p", full_length_script())
        .script("720p", full_length_script());
    let harness = Harness::new(runner);
    let episode = harness.episode(ANIME_ID, 1);
    let source = harness.upload("ep1.mkv");

    let job = TranscodeJob::new(episode.id, source).qualities("1080,720");
    harness.orchestrator().run(&job).await.unwrap();

    let history = harness.store.progress_history(episode.id);
    assert_eq!(history[0].stage, TranscodeStage::Probing);
    let first_transcoding = history
        .iter()
        .position(|record| record.stage == TranscodeStage::Transcoding)
        .unwrap();
    assert!(history[..first_transcoding]
        .iter()
        .all(|record| record.stage == TranscodeStage::Probing));

    let running: Vec<_> = history
        .iter()
        .filter(|record| record.stage == TranscodeStage::Transcoding)
        .collect();
    for pair in running.windows(2) {
        let (previous, next) = (pair[0], pair[1]);
        assert!(next.quality_index >= previous.quality_index);
        if next.quality_index == previous.quality_index {
            assert!(next.quality_progress >= previous.quality_progress);
        }
        assert!(next.progress >= previous.progress);
        assert!(next.progress < 100.0 || next.quality_progress == 100.0);
    }
    // The millisecond reading lands halfway through the first rendition.
    assert!(running
        .iter()
        .any(|record| record.quality_index == 1 && record.quality_progress == 50.0));
    assert_eq!(running.last().unwrap().qualities_total, 2);
    assert_eq!(history.last().unwrap().stage, TranscodeStage::Done);
}

#[tokio::test]
async fn output_flushed_at_exit_is_parsed() {
    let runner = ScriptedRunner::new("1920x1080", Some(600.0)).script(
        "1080p",
        EncodeScript::success(&["out_time_us=100000000\nprogress=continue\n"])
            .trailing("out_time_us=450000000\nprogress=end\n"),
    );
    let harness = Harness::new(runner);
    let episode = harness.episode(ANIME_ID, 6);

    let job = TranscodeJob::new(episode.id, harness.upload("ep6.mkv")).qualities("1080");
    harness.orchestrator().run(&job).await.unwrap();

    let history = harness.store.progress_history(episode.id);
    assert!(history.iter().any(|record| {
        record.stage == TranscodeStage::Transcoding && record.quality_progress == 75.0
    }));
}

#[tokio::test]
async fn rerun_updates_rows_in_place() {
    let harness = Harness::new(ScriptedRunner::new("1920x1080", Some(1420.0)));
    let episode = harness.episode(ANIME_ID, 2);

    let job = TranscodeJob::new(episode.id, harness.upload("ep2.mkv"))
        .qualities("1080,720")
        .language("ja");
    harness.orchestrator().run(&job).await.unwrap();
    let first = harness.media.list_media(episode.id).unwrap();

    let rerun = TranscodeJob::new(episode.id, harness.upload("ep2.mkv"))
        .qualities("720,1080")
        .language("ja")
        .overwrite(true);
    let report = harness.orchestrator().run(&rerun).await.unwrap();
    let second = harness.media.list_media(episode.id).unwrap();

    assert_eq!(second.len(), 2);
    let mut first_ids: Vec<_> = first.iter().map(|row| row.id).collect();
    let mut second_ids: Vec<_> = second.iter().map(|row| row.id).collect();
    first_ids.sort_unstable();
    second_ids.sort_unstable();
    assert_eq!(first_ids, second_ids);

    let primary: Vec<_> = second.iter().filter(|row| row.is_primary).collect();
    assert_eq!(primary.len(), 1);
    assert_eq!(primary[0].quality.as_deref(), Some("720p"));
    assert_eq!(report.primary().unwrap().label, "720p");

    let started = harness.runner.started.lock().unwrap().clone();
    assert_eq!(started.last().unwrap()[1], "-y");
}

#[tokio::test]
async fn encoder_failure_keeps_committed_renditions() {
    let runner = ScriptedRunner::new("1920x1080", Some(600.0))
        .script("1080p", full_length_script())
        .script("720p", EncodeScript::failure("Conversion failed!"));
    let harness = Harness::new(runner);
    let episode = harness.episode(ANIME_ID, 4);
    let source = harness.upload("ep4.mkv");
    harness.tracker.acquire_lock(ANIME_ID, episode.id).unwrap();

    let job = TranscodeJob::new(episode.id, source.clone()).qualities("1080,720,480");
    let err = harness.orchestrator().run(&job).await.unwrap_err();
    assert!(matches!(err, TranscodeError::Encode { .. }));

    let progress = harness.tracker.get_progress(episode.id).unwrap();
    assert_eq!(progress.stage, TranscodeStage::Failed);
    assert_eq!(progress.error_kind, Some(FailureKind::EncodeFailure));
    assert_eq!(progress.error.as_deref(), Some("Conversion failed!"));
    assert_eq!(progress.message.as_deref(), Some("FFmpeg failed for 720p."));
    assert_eq!(progress.quality.as_deref(), Some("720p"));
    assert_eq!(progress.quality_index, 2);

    let media = harness.media.list_media(episode.id).unwrap();
    assert_eq!(media.len(), 1);
    assert_eq!(media[0].quality.as_deref(), Some("1080p"));
    assert!(media[0].is_primary);

    // 480p never starts once 720p fails.
    assert_eq!(harness.runner.started_outputs().len(), 2);
    assert_eq!(harness.store.get(&lock_key(ANIME_ID)).unwrap(), None);
    assert!(harness.source_root().join(&source).exists());
}

#[tokio::test]
async fn unknown_duration_uses_encoder_clock() {
    let runner = ScriptedRunner::new("1280x720", None).script(
        "720p",
        EncodeScript::success(&["out_time_us=2000000\n", "out_time_us=4000000\n"]),
    );
    let harness = Harness::new(runner);
    let episode = harness.episode(ANIME_ID, 5);

    let job = TranscodeJob::new(episode.id, harness.upload("ep5.mkv"))
        .qualities("720")
        .keep_source(true);
    let report = harness.orchestrator().run(&job).await.unwrap();

    assert_eq!(report.duration_micros, None);
    assert!(!report.source_removed);
    let media = harness.media.list_media(episode.id).unwrap();
    assert_eq!(media[0].duration, None);
    assert_eq!(media[0].language, None);
    assert!(media[0].path.ends_with("/720p.mp4"));
    assert_eq!(
        harness.tracker.get_progress(episode.id).unwrap().stage,
        TranscodeStage::Done
    );
}

#[tokio::test]
async fn input_failures_are_recorded_and_release_the_lock() {
    struct Case {
        runner: ScriptedRunner,
        qualities: &'static str,
        upload: bool,
        kind: FailureKind,
    }

    let refusing = ScriptedRunner {
        refuse_start: true,
        ..ScriptedRunner::new("1920x1080", Some(60.0))
    };
    let broken_probe = ScriptedRunner {
        probe_exit_code: 1,
        ..ScriptedRunner::new("", None)
    };
    let cases = vec![
        Case {
            runner: ScriptedRunner::new("1920x1080", Some(60.0)),
            qualities: "1080",
            upload: false,
            kind: FailureKind::SourceNotFound,
        },
        Case {
            runner: ScriptedRunner::new("1920x1080", Some(60.0)),
            qualities: "1080,360",
            upload: true,
            kind: FailureKind::UnsupportedQuality,
        },
        Case {
            runner: ScriptedRunner::new("640x360", Some(60.0)),
            qualities: "1080,720",
            upload: true,
            kind: FailureKind::NoEligibleQuality,
        },
        Case {
            runner: ScriptedRunner::new("N/A", Some(60.0)),
            qualities: "1080",
            upload: true,
            kind: FailureKind::ProbeFailure,
        },
        Case {
            runner: broken_probe,
            qualities: "1080",
            upload: true,
            kind: FailureKind::ProbeFailure,
        },
        Case {
            runner: refusing,
            qualities: "1080",
            upload: true,
            kind: FailureKind::LaunchFailure,
        },
    ];

    for case in cases {
        let harness = Harness::new(case.runner);
        let episode = harness.episode(ANIME_ID, 9);
        let source = if case.upload {
            harness.upload("ep9.mkv")
        } else {
            "uploads/missing.mkv".to_string()
        };
        harness.tracker.acquire_lock(ANIME_ID, episode.id).unwrap();

        let job = TranscodeJob::new(episode.id, source).qualities(case.qualities);
        let err = harness.orchestrator().run(&job).await.unwrap_err();
        assert_eq!(err.kind(), case.kind);

        let progress = harness.tracker.get_progress(episode.id).unwrap();
        assert_eq!(progress.stage, TranscodeStage::Failed);
        assert_eq!(progress.error_kind, Some(case.kind));
        assert!(progress.error.is_some());
        assert_eq!(harness.store.get(&lock_key(ANIME_ID)).unwrap(), None);
        assert!(harness.media.list_media(episode.id).unwrap().is_empty());
    }
}

#[tokio::test]
async fn missing_episode_fails_without_touching_media() {
    let harness = Harness::new(ScriptedRunner::new("1920x1080", Some(60.0)));
    let job = TranscodeJob::new(404, harness.upload("ghost.mkv"));
    let err = harness.orchestrator().run(&job).await.unwrap_err();
    assert_eq!(err.kind(), FailureKind::EpisodeNotFound);
    let progress = harness.tracker.get_progress(404).unwrap();
    assert_eq!(progress.stage, TranscodeStage::Failed);
    assert_eq!(progress.error.as_deref(), Some("Episode #404 was not found."));
    assert!(harness.runner.started_outputs().is_empty());
}
