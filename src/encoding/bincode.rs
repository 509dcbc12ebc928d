use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Serialize a value using bincode. Encoding an in-memory value is
/// infallible for the types this crate stores; a failure here means a
/// broken `Serialize` impl.
pub fn serialize<T: Serialize>(value: &T) -> Vec<u8> {
    match bincode::serialize(value) {
        Ok(bytes) => bytes,
        Err(e) => panic!("bincode could not encode an in-memory value: {e}"),
    }
}

/// Deserialize a value from a byte slice using bincode.
pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct TestStruct {
        id: u32,
        name: String,
        active: bool,
    }

    #[test]
    fn round_trip() {
        let original = TestStruct {
            id: 42,
            name: "test".to_string(),
            active: true,
        };

        let bytes = serialize(&original);
        let decoded: TestStruct = deserialize(&bytes).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn invalid_data() {
        let result: Result<String> = deserialize(&[0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(result, Err(Error::Corrupted(_))));
    }
}
