/// Generate a `#[tokio::test]` for each case directory under `cases/`.
#[macro_export]
macro_rules! case_test {
    ($( $name:ident => $folder:expr ),* $(,)?) => {
        $(
            #[tokio::test]
            async fn $name() {
                let case_dir = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"))
                    .join("tests/integration/cases")
                    .join($folder);
                crate::runner::run_case(&case_dir).await;
            }
        )*
    };
}
