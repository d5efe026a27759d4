mod wayland;
