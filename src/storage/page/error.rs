use thiserror::Error;

#[derive(Error, Debug)]
pub enum PageError {
    #[error("Index name '{0}' exceeds {1} bytes")]
    NameTooLong(String, usize),

    #[error("Header page is full")]
    HeaderPageFull,

    #[error("No record for index '{0}'")]
    RecordNotFound(String),

    #[error("Record for index '{0}' already exists")]
    RecordExists(String),
}
