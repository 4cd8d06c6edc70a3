// Copyright (c) the magicmount contributors
// SPDX-License-Identifier: Apache-2.0

macro_rules! fixtures {
    () => {
        use rstest::fixture;
        use tempdir::TempDir;

        #[allow(dead_code)]
        fn init_logging() {
            let sub = tracing_subscriber::FmtSubscriber::builder()
                .with_max_level(tracing::Level::TRACE)
                .without_time()
                .with_test_writer()
                .finish();
            let _ = tracing::subscriber::set_global_default(sub);
        }

        #[fixture]
        fn tmpdir() -> TempDir {
            TempDir::new("magicmount-test-").expect("failed to create dir for test")
        }

        #[allow(dead_code)]
        fn ensure(path: std::path::PathBuf, data: &str) {
            std::fs::create_dir_all(path.parent().unwrap()).expect("failed to make dirs");
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .open(path)
                .expect("failed to create file");
            std::io::copy(&mut data.as_bytes(), &mut file).expect("failed to write file data");
        }

        /// Scratch directories an overlay test runs against.
        #[allow(dead_code)]
        struct Layout {
            modules: std::path::PathBuf,
            mirror: std::path::PathBuf,
            shadow: std::path::PathBuf,
            live: std::path::PathBuf,
        }

        #[allow(dead_code)]
        impl Layout {
            fn new(root: &std::path::Path) -> Self {
                Self {
                    modules: root.join("modules"),
                    mirror: root.join("mirror"),
                    shadow: root.join("shadow"),
                    live: root.join("live"),
                }
            }

            fn context<'a>(
                &'a self,
                mounter: &'a dyn crate::env::Mounter,
            ) -> crate::overlay::Context<'a> {
                crate::overlay::Context {
                    module_root: &self.modules,
                    mirror: &self.mirror,
                    shadow: &self.shadow,
                    live_root: &self.live,
                    mounter,
                }
            }
        }

        /// Records every mount request instead of touching the kernel.
        #[derive(Default, Clone)]
        #[allow(dead_code)]
        struct RecordingMounter {
            binds: std::rc::Rc<
                std::cell::RefCell<Vec<(std::path::PathBuf, std::path::PathBuf)>>,
            >,
            ro_mounts: std::rc::Rc<
                std::cell::RefCell<Vec<(std::path::PathBuf, std::path::PathBuf)>>,
            >,
            unmounts: std::rc::Rc<std::cell::RefCell<Vec<std::path::PathBuf>>>,
        }

        #[allow(dead_code)]
        impl RecordingMounter {
            fn bind_set(
                &self,
            ) -> std::collections::HashSet<(std::path::PathBuf, std::path::PathBuf)> {
                self.binds.borrow().iter().cloned().collect()
            }

            fn bind_count(&self) -> usize {
                self.binds.borrow().len()
            }
        }

        impl crate::env::Mounter for RecordingMounter {
            fn bind(
                &self,
                source: &std::path::Path,
                target: &std::path::Path,
            ) -> crate::Result<()> {
                self.binds
                    .borrow_mut()
                    .push((source.to_owned(), target.to_owned()));
                Ok(())
            }

            fn mount_ro(
                &self,
                device: &std::path::Path,
                target: &std::path::Path,
                _fstype: &str,
            ) -> crate::Result<()> {
                self.ro_mounts
                    .borrow_mut()
                    .push((device.to_owned(), target.to_owned()));
                Ok(())
            }

            fn unmount(&self, target: &std::path::Path) -> crate::Result<()> {
                self.unmounts.borrow_mut().push(target.to_owned());
                Ok(())
            }
        }
    };
}
