use std::io;

/// Lifecycle and coverage hooks for the systems under test.
///
/// The engine starts the systems before every executed query and kills
/// them afterwards. `traces` is polled before each action and once at the
/// end of a session.
pub trait SutControl {
    fn start(&mut self) -> io::Result<()>;

    fn kill(&mut self) -> io::Result<()>;

    /// Coverage traces collected since the last call.
    fn traces(&mut self) -> Vec<String>;
}

impl<T: SutControl + ?Sized> SutControl for Box<T> {
    fn start(&mut self) -> io::Result<()> {
        (**self).start()
    }

    fn kill(&mut self) -> io::Result<()> {
        (**self).kill()
    }

    fn traces(&mut self) -> Vec<String> {
        (**self).traces()
    }
}

/// No controllable systems: the peers are started out of band.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSut;

impl SutControl for NoSut {
    fn start(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn traces(&mut self) -> Vec<String> {
        Vec::new()
    }
}
