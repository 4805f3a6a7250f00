//! Common test utilities and helpers for integration tests

use std::path::Path;

use datafusion::arrow::array::Array;
use datafusion::arrow::util::display::array_value_to_string;
use lakebook_core::{DataFrame, Session, conf};
use tempfile::TempDir;

/// `target = 1 + 2 * column1 + 3 * column2`
pub const SAMPLE_CSV: &str = "\
id,column1,column2,date_column,target
1,50,10,2024-01-01,131
2,150,20,2024-01-15,361
3,120,5,2024-02-01,256
4,80,30,2024-02-10,251
5,150,1,2024-03-01,304
6,200,12,2024-03-05,437
";

pub const NULLS_CSV: &str = "\
id,name,score,active
1,alice,10.5,true
2,,7.0,
3,carol,,false
4,,,
";

/// A session whose warehouse and DBFS root live in a temporary directory.
pub struct TestEnv {
    pub dir: TempDir,
    pub session: Session,
}

impl TestEnv {
    pub fn path(&self, name: &str) -> String {
        self.dir.path().join(name).to_string_lossy().into_owned()
    }

    /// Write a file into the temporary directory and return its path.
    pub fn write_file(&self, name: &str, contents: &str) -> String {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path.to_string_lossy().into_owned()
    }

    pub async fn sample(&self) -> DataFrame {
        let path = self.write_file("sample_data.csv", SAMPLE_CSV);
        self.session
            .read()
            .option("header", true)
            .option("inferSchema", true)
            .csv(&path)
            .await
            .unwrap()
    }
}

pub fn test_env() -> TestEnv {
    let dir = TempDir::new().unwrap();
    let session = Session::builder()
        .app_name("lakebook-test")
        .master("local[2]")
        .config(conf::WAREHOUSE_DIR, path_str(&dir.path().join("warehouse")))
        .config(conf::DBFS_ROOT, path_str(&dir.path().join("dbfs")))
        .create()
        .unwrap();
    TestEnv { dir, session }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Rows rendered as `a|b|c`, sorted so comparisons ignore partitioning.
#[allow(dead_code)] // not every test binary compares rows
pub async fn sorted_rows(df: &DataFrame) -> Vec<String> {
    let mut rows = Vec::new();
    for batch in df.collect().await.unwrap() {
        for row in 0..batch.num_rows() {
            let cells: Vec<String> = batch
                .columns()
                .iter()
                .map(|c| {
                    if c.is_null(row) {
                        "NULL".to_string()
                    } else {
                        array_value_to_string(c, row).unwrap()
                    }
                })
                .collect();
            rows.push(cells.join("|"));
        }
    }
    rows.sort();
    rows
}
