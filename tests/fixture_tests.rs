//! Hand-encoded binaries from `tests/fixtures/modules.json`. Valid modules
//! must decode, re-encode to the same bytes and run; invalid ones must fail
//! with the named error.

mod common;

#[cfg(test)]
mod tests {
    use super::common::{Interpreter, Value};
    use base64::{engine::general_purpose, Engine as _};
    use rstest::rstest;
    use serde::de::{self, Deserializer};
    use serde::Deserialize;
    use stackasm::{Host, Module};
    use std::fs;

    const FIXTURES: &str = "tests/fixtures/modules.json";

    #[derive(Deserialize)]
    struct Fixtures {
        valid: Vec<ValidModule>,
        invalid: Vec<InvalidModule>,
    }

    #[derive(Deserialize)]
    struct ValidModule {
        name: String,
        bin: Base64DecodedBytes,
        invoke: Vec<Invoke>,
        memory: Option<Base64DecodedBytes>,
        global: Option<ExpectedGlobal>,
    }

    #[derive(Deserialize)]
    struct InvalidModule {
        name: String,
        bin: Base64DecodedBytes,
        error: String,
    }

    #[derive(Deserialize, Debug)]
    struct Invoke {
        export: String,
        args: Vec<i32>,
        expected: Vec<i32>,
    }

    #[derive(Deserialize, Debug)]
    struct ExpectedGlobal {
        name: String,
        value: i32,
    }

    #[derive(Debug)]
    pub struct Base64DecodedBytes(Vec<u8>);

    impl<'de> Deserialize<'de> for Base64DecodedBytes {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s: String = String::deserialize(deserializer)?;
            let decoded = general_purpose::STANDARD.decode(s).map_err(de::Error::custom)?;
            Ok(Base64DecodedBytes(decoded))
        }
    }

    fn load() -> Fixtures {
        let json = fs::read_to_string(FIXTURES).unwrap_or_else(|_| panic!("couldn't read file: {}", FIXTURES));
        serde_json::from_str(&json).unwrap()
    }

    fn valid(name: &str) -> ValidModule {
        load()
            .valid
            .into_iter()
            .find(|m| m.name == name)
            .unwrap_or_else(|| panic!("no fixture named {}", name))
    }

    fn host() -> Interpreter {
        Interpreter::new().func("env", "double", |args| match args {
            [Value::I32(x)] => vec![Value::I32(x.wrapping_mul(2))],
            _ => vec![],
        })
    }

    /// Variant name of an error's `Debug` form, e.g. `NonCanonical`.
    fn variant(debug: &str) -> &str {
        let end = debug.find(|c| c == '(' || c == ' ' || c == '{').unwrap_or(debug.len());
        &debug[..end]
    }

    #[rstest]
    #[case("empty")]
    #[case("add")]
    #[case("memory")]
    #[case("start")]
    #[case("import")]
    #[case("loop")]
    fn valid_module_round_trips_and_runs(#[case] name: &str) {
        let fixture = valid(name);
        let bytes = &fixture.bin.0;
        let module = Module::from_bytes(bytes).unwrap_or_else(|e| panic!("{}: {}", name, e));
        assert_eq!(&module.to_bytes().unwrap(), bytes, "{} does not re-encode identically", name);

        let mut host = host();
        let mut instance = host.instantiate(bytes, &module.imports).unwrap();
        for call in &fixture.invoke {
            let args: Vec<Value> = call.args.iter().map(|v| Value::I32(*v)).collect();
            let expected: Vec<Value> = call.expected.iter().map(|v| Value::I32(*v)).collect();
            assert_eq!(instance.invoke(&call.export, &args).unwrap(), expected, "{}: {:?}", name, call);
        }
        if let Some(memory) = &fixture.memory {
            assert_eq!(&instance.memory()[..memory.0.len()], memory.0.as_slice());
        }
        if let Some(global) = &fixture.global {
            assert_eq!(instance.global(&global.name), Some(Value::I32(global.value)));
        }
    }

    #[test]
    fn every_valid_fixture_is_listed() {
        let names: Vec<String> = load().valid.into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["empty", "add", "memory", "start", "import", "loop"]);
    }

    #[test]
    fn invalid_modules_are_rejected() {
        let fixtures = load();
        assert!(!fixtures.invalid.is_empty());
        for fixture in fixtures.invalid {
            let err = match Module::from_bytes(&fixture.bin.0) {
                Ok(module) => panic!("{} decoded to {}", fixture.name, module),
                Err(err) => err,
            };
            let debug = format!("{:?}", err);
            assert_eq!(variant(&debug), fixture.error, "{}: {}", fixture.name, err);
        }
    }
}
