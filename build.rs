use std::env;

#[derive(Clone, Copy, Debug)]
enum GetOneError {
    None,
    Multiple,
}

trait IteratorExt: Iterator {
    fn get_one(self) -> Result<Self::Item, GetOneError>;
}

impl<T: Iterator> IteratorExt for T {
    fn get_one(mut self) -> Result<Self::Item, GetOneError> {
        match (self.next(), self.next()) {
            (Some(res), None) => Ok(res),
            (None, _) => Err(GetOneError::None),
            _ => Err(GetOneError::Multiple),
        }
    }
}

fn main() {
    // Without a device feature only the register independent core is built
    // (feature composition, event dispatch, driver state machines). That is
    // what host side unit tests exercise.
    match env::vars()
        .map(|(a, _)| a)
        .filter(|x| x.starts_with("CARGO_FEATURE_STM32F1"))
        .get_one()
    {
        Ok(_) | Err(GetOneError::None) => {}
        Err(GetOneError::Multiple) => panic!("Multiple stm32xx Cargo features enabled"),
    }
}
