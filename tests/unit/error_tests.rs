use session_sentinel::AppError;

#[test]
fn display_uses_category_prefix() {
    let cases = [
        (AppError::Config("bad".into()), "config: bad"),
        (AppError::Backend("down".into()), "backend: down"),
        (
            AppError::AdmissionConflict("u1:s1".into()),
            "admission conflict: u1:s1",
        ),
        (AppError::Producer("boom".into()), "producer: boom"),
        (AppError::Codec("garbled".into()), "codec: garbled"),
        (AppError::InvalidInput("empty".into()), "invalid input: empty"),
    ];
    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn error_message_no_trailing_period() {
    let err = AppError::AdmissionConflict("task u1:s1 is already in RUNNING state".into());
    let s = err.to_string();
    assert!(!s.ends_with('.'), "error message must not end with a period: {s}");
}

#[test]
fn toml_error_maps_to_config() {
    let err: AppError = toml::from_str::<toml::Value>("not = [valid")
        .expect_err("invalid toml")
        .into();
    assert!(matches!(err, AppError::Config(ref msg) if msg.starts_with("invalid config")));
}

#[test]
fn json_error_maps_to_codec() {
    let err: AppError = serde_json::from_str::<serde_json::Value>("{")
        .expect_err("invalid json")
        .into();
    assert!(matches!(err, AppError::Codec(_)));
}

#[test]
fn redis_error_maps_to_backend() {
    let err: AppError = redis::Client::open("not a redis url")
        .expect_err("invalid url")
        .into();
    assert!(matches!(err, AppError::Backend(_)));
}
