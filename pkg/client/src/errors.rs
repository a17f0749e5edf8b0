//! The bootstrap client's error type: everything `raftkv-core` defines, plus
//! the HTTP-transport failures `reqwest` can raise.

error_chain! {
	links {
		Core(raftkv_core::Error, raftkv_core::ErrorKind);
	}

	foreign_links {
		Http(::reqwest::Error);
	}
}
