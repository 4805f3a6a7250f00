//! Integration tests for the notebook utilities: dbfs files and widgets

mod common;

use common::test_env;
use lakebook_core::LakebookError;

#[tokio::test]
async fn test_dbfs_file_operations() {
    let env = test_env();
    let fs = env.session.utils().fs();

    assert!(fs.mkdirs("dbfs:/FileStore/tables").await.unwrap());
    let written = fs
        .put("dbfs:/FileStore/notes.txt", "hello lakebook\n", false)
        .await
        .unwrap();
    assert_eq!(written, 15);
    assert!(env.dir.path().join("dbfs/FileStore/notes.txt").is_file());
    assert!(
        fs.put("dbfs:/FileStore/notes.txt", "again", false)
            .await
            .is_err()
    );
    fs.put("dbfs:/FileStore/notes.txt", "hello again\n", true)
        .await
        .unwrap();

    let entries = fs.ls("dbfs:/FileStore/").await.unwrap();
    assert_eq!(entries.len(), 2);
    // directories are listed first
    assert_eq!(entries[0].name, "tables/");
    assert!(entries[0].is_dir());
    assert_eq!(entries[0].size, 0);
    assert_eq!(entries[1].path, "dbfs:/FileStore/notes.txt");
    assert_eq!(entries[1].name, "notes.txt");
    assert_eq!(entries[1].size, 12);
    assert!(!entries[1].is_dir());
    assert!(entries[1].modification_time > 0);

    assert_eq!(
        fs.head("dbfs:/FileStore/notes.txt", None).await.unwrap(),
        "hello again\n"
    );
    assert_eq!(
        fs.head("dbfs:/FileStore/notes.txt", Some(5)).await.unwrap(),
        "hello"
    );

    assert!(fs.rm("dbfs:/FileStore/notes.txt", false).await.unwrap());
    assert!(!fs.rm("dbfs:/FileStore/notes.txt", false).await.unwrap());
    assert!(fs.ls("dbfs:/FileStore/missing").await.is_err());
    assert!(fs.ls("dbfs:/../outside").await.is_err());
}

#[tokio::test]
async fn test_files_written_by_dataframes_are_listed() {
    let env = test_env();
    env.sample()
        .await
        .write()
        .parquet("dbfs:/FileStore/sample_data.parquet")
        .await
        .unwrap();
    let entries = env
        .session
        .utils()
        .fs()
        .ls("dbfs:/FileStore/")
        .await
        .unwrap();
    assert!(
        entries
            .iter()
            .any(|e| e.path == "dbfs:/FileStore/sample_data.parquet/" && e.is_dir())
    );
}

#[test]
fn test_widgets() {
    let env = test_env();
    let widgets = env.session.utils().widgets();

    assert!(matches!(
        widgets.get("parameter"),
        Err(LakebookError::WidgetNotDefined(_))
    ));
    widgets.text("parameter", "", Some("Input Parameter")).unwrap();
    assert_eq!(widgets.get("parameter").unwrap(), "");
    widgets.bind("parameter", "42").unwrap();
    assert_eq!(widgets.get("parameter").unwrap(), "42");

    // a binding given before the widget is defined still wins
    widgets.bind("region", "eu").unwrap();
    widgets
        .dropdown("region", "us", &["us", "eu"], None)
        .unwrap();
    assert_eq!(widgets.get("region").unwrap(), "eu");
    assert!(matches!(
        widgets.bind("region", "apac"),
        Err(LakebookError::IllegalArgument(_))
    ));
    assert!(matches!(
        widgets.dropdown("tier", "gold", &["silver", "bronze"], None),
        Err(LakebookError::IllegalArgument(_))
    ));

    let all = widgets.get_all();
    assert_eq!(all.len(), 2);
    assert_eq!(all["parameter"], "42");
    assert_eq!(all["region"], "eu");

    widgets.remove("parameter").unwrap();
    assert!(widgets.widget("parameter").is_none());
    assert!(matches!(
        widgets.remove("parameter"),
        Err(LakebookError::WidgetNotDefined(_))
    ));
    widgets.remove_all();
    assert!(widgets.widget("region").is_none());
}
